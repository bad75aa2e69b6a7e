// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

//! Generic page-accounting algorithms used by the kernel's memory manager.
//!
//! This crate deliberately knows nothing about addresses, page sizes, or the
//! kernel's locking rules -- it deals purely in page *numbers* over a bitmap.
//! Keeping it free of kernel types means the interesting algorithms can be
//! exercised on the host, where running tests is cheap.

/// Direction hint for [`PageMap::find_free_run`].
///
/// The choice of strategy is purely a placement hint used to segregate
/// classes of allocation (conventionally, thread stacks grow down from the
/// top of the heap while data buffers grow up from the bottom), which keeps
/// long-lived and short-lived allocations from interleaving quite so badly.
/// Neither strategy guarantees placement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SearchStrategy {
    /// Scan page numbers descending from the top of the map.
    TopDown,
    /// Scan page numbers ascending from the bottom of the map.
    BottomUp,
}

/// Tracks which pages of a fixed region are in use, one bit per page.
///
/// `WORDS` is the size of the backing bitmap in bytes; the map can describe
/// up to `WORDS * 8` pages. The number of pages actually managed is given at
/// construction and may be smaller.
///
/// A page is either free or used; there is no record of *who* used it. The
/// caller is responsible for returning exactly the ranges it was granted.
#[derive(Clone)]
pub struct PageMap<const WORDS: usize> {
    /// One bit per page; a set bit means the page is used.
    bits: [u8; WORDS],
    /// Number of pages actually managed, `<= WORDS * 8`.
    page_count: u16,
}

impl<const WORDS: usize> PageMap<WORDS> {
    /// Creates a map of `page_count` pages, all free.
    ///
    /// # Panics
    ///
    /// If `page_count` does not fit in a `WORDS`-byte bitmap.
    pub const fn new(page_count: u16) -> Self {
        assert!(page_count as usize <= WORDS * 8);
        Self {
            bits: [0; WORDS],
            page_count,
        }
    }

    /// Checks whether `page` is currently free.
    ///
    /// # Panics
    ///
    /// If `page` is out of range for this map.
    pub fn is_free(&self, page: u16) -> bool {
        assert!(page < self.page_count);
        self.bits[usize::from(page >> 3)] & (1 << (page & 0b111)) == 0
    }

    /// Marks `page` as used.
    pub fn mark_used(&mut self, page: u16) {
        assert!(page < self.page_count);
        self.bits[usize::from(page >> 3)] |= 1 << (page & 0b111);
    }

    /// Marks `page` as free.
    pub fn mark_free(&mut self, page: u16) {
        assert!(page < self.page_count);
        self.bits[usize::from(page >> 3)] &= !(1 << (page & 0b111));
    }

    /// Marks the `count` pages starting at `first` as used.
    pub fn mark_run_used(&mut self, first: u16, count: u16) {
        for page in first..first + count {
            self.mark_used(page);
        }
    }

    /// Marks the `count` pages starting at `first` as free.
    pub fn mark_run_free(&mut self, first: u16, count: u16) {
        for page in first..first + count {
            self.mark_free(page);
        }
    }

    /// Returns the number of pages being managed.
    pub fn total_pages(&self) -> u16 {
        self.page_count
    }

    /// Returns the number of currently free pages.
    pub fn free_pages(&self) -> u16 {
        (0..self.page_count).filter(|&p| self.is_free(p)).count() as u16
    }

    /// Returns the number of currently used pages.
    pub fn used_pages(&self) -> u16 {
        self.page_count - self.free_pages()
    }

    /// Finds a run of `count` contiguously free pages, scanning in the
    /// direction given by `strategy`, and returns the *lowest* page number
    /// of the run. The candidate run restarts whenever a used page is
    /// encountered.
    ///
    /// Returns `None` if no such run exists. The map is not modified; the
    /// caller marks the run used once it has committed to the allocation.
    pub fn find_free_run(
        &self,
        count: u16,
        strategy: SearchStrategy,
    ) -> Option<u16> {
        if count == 0 || count > self.page_count {
            return None;
        }

        let mut start: Option<u16> = None;
        let mut run = 0;

        for step in 0..self.page_count {
            let page = match strategy {
                SearchStrategy::BottomUp => step,
                SearchStrategy::TopDown => self.page_count - (step + 1),
            };

            if self.is_free(page) {
                run += 1;

                // Track the lowest page seen in this run; for a top-down
                // scan that is the page we just visited.
                start = Some(match start {
                    None => page,
                    Some(s) => s.min(page),
                });

                if run == count {
                    return start;
                }
            } else {
                // Wasn't free? Start the search from scratch.
                start = None;
                run = 0;
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // An 8-page map fits in one word and matches the allocator scenarios in
    // the scheduler's own tests.
    fn small_map() -> PageMap<1> {
        PageMap::new(8)
    }

    #[test]
    fn new_map_is_entirely_free() {
        let map = small_map();
        assert_eq!(map.total_pages(), 8);
        assert_eq!(map.free_pages(), 8);
        assert_eq!(map.used_pages(), 0);
        for page in 0..8 {
            assert!(map.is_free(page), "page {page} should start free");
        }
    }

    #[test]
    fn mark_and_free_round_trip_restores_counts() {
        let mut map = small_map();
        map.mark_run_used(2, 3);
        assert_eq!(map.free_pages(), 5);
        assert!(!map.is_free(3));
        map.mark_run_free(2, 3);
        assert_eq!(map.free_pages(), 8);
    }

    #[test]
    fn bottom_up_prefers_lowest_pages() {
        let map = small_map();
        assert_eq!(map.find_free_run(3, SearchStrategy::BottomUp), Some(0));
    }

    #[test]
    fn top_down_prefers_highest_pages() {
        let map = small_map();
        // A two-page run found from the top is pages 6..=7; the result is
        // the lowest page of the run.
        assert_eq!(map.find_free_run(2, SearchStrategy::TopDown), Some(6));
    }

    #[test]
    fn run_restarts_on_used_page() {
        let mut map = small_map();
        // Free pages: 0 1 [used] 3 4 5 6 7. A 4-page run must skip the
        // fragment below the used page.
        map.mark_used(2);
        assert_eq!(map.find_free_run(4, SearchStrategy::BottomUp), Some(3));
        assert_eq!(map.find_free_run(4, SearchStrategy::TopDown), Some(4));
    }

    #[test]
    fn exact_fit_in_a_gap_is_found() {
        let mut map = small_map();
        map.mark_used(0);
        map.mark_used(4);
        map.mark_used(7);
        // The only 3-page run is 1..=3, whichever end the scan starts from.
        assert_eq!(map.find_free_run(3, SearchStrategy::TopDown), Some(1));
        assert_eq!(map.find_free_run(3, SearchStrategy::BottomUp), Some(1));
    }

    #[test]
    fn oversized_requests_fail() {
        let mut map = small_map();
        assert_eq!(map.find_free_run(9, SearchStrategy::BottomUp), None);
        map.mark_used(4);
        assert_eq!(map.find_free_run(5, SearchStrategy::BottomUp), None);
        assert_eq!(map.find_free_run(5, SearchStrategy::TopDown), None);
    }

    #[test]
    fn zero_page_requests_fail() {
        let map = small_map();
        assert_eq!(map.find_free_run(0, SearchStrategy::BottomUp), None);
    }

    #[test]
    fn full_map_has_no_runs() {
        let mut map = small_map();
        map.mark_run_used(0, 8);
        assert_eq!(map.free_pages(), 0);
        assert_eq!(map.find_free_run(1, SearchStrategy::BottomUp), None);
    }

    #[test]
    fn freeing_reopens_runs_for_subsequent_allocations() {
        let mut map = small_map();
        // Mirror of the classic placement sequence: take 3 from the bottom,
        // 2 from the top, then give the bottom back and ask for 5.
        map.mark_run_used(0, 3);
        map.mark_run_used(6, 2);
        assert_eq!(map.find_free_run(5, SearchStrategy::BottomUp), None);
        map.mark_run_free(0, 3);
        assert_eq!(map.find_free_run(5, SearchStrategy::BottomUp), Some(0));
    }

    #[test]
    fn map_spanning_multiple_words_tracks_high_pages() {
        let mut map: PageMap<4> = PageMap::new(30);
        map.mark_used(29);
        assert!(!map.is_free(29));
        assert_eq!(map.free_pages(), 29);
        assert_eq!(map.find_free_run(8, SearchStrategy::TopDown), Some(21));
        map.mark_free(29);
        assert_eq!(map.find_free_run(8, SearchStrategy::TopDown), Some(22));
    }
}
