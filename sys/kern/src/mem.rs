// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Page-granular dynamic memory.
//!
//! One contiguous RAM region, cut into [`crate::config::PAGE_BYTES`]-sized
//! pages, backs both thread stacks and application data. The bookkeeping --
//! a bitmap with a contiguous-run search -- lives in `kerncore`, where it
//! can be tested on the host; this module owns the region itself and the
//! address arithmetic.
//!
//! There is no per-owner tracking and no double-free detection: callers
//! return exactly the ranges they were granted, by base address and length,
//! or the map rots. Thread stacks conventionally allocate `TopDown` and
//! data buffers `BottomUp`, which keeps the two populations from
//! interleaving and fragmenting the map.
//!
//! All map mutations run with interrupts masked, which also holds off the
//! preemption tick; the allocator is therefore safe against context
//! switches but must not be entered from interrupt context.

use core::cell::UnsafeCell;

use crate::config::{HEAP_BYTES, HEAP_MAP_WORDS, HEAP_PAGES, PAGE_BYTES};
use crate::err::OutOfMemory;

pub use kerncore::SearchStrategy;

use kerncore::PageMap;

/// The allocator: a RAM region plus the page map over it.
pub(crate) struct Heap {
    base: *mut u8,
    map: PageMap<HEAP_MAP_WORDS>,
}

impl Heap {
    pub(crate) const fn empty() -> Self {
        Self {
            base: core::ptr::null_mut(),
            map: PageMap::new(HEAP_PAGES),
        }
    }

    /// Points the allocator at its region.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of [`HEAP_BYTES`] bytes
    /// for the rest of time, and must not be in use by anything else.
    pub(crate) unsafe fn init(&mut self, base: *mut u8) {
        self.base = base;
    }

    /// Finds the smallest run of contiguous free pages covering at least
    /// `bytes`, marks it used, and returns its base address and actual
    /// (rounded-up) size in bytes.
    pub(crate) fn allocate(
        &mut self,
        bytes: usize,
        strategy: SearchStrategy,
    ) -> Result<(*mut u8, usize), OutOfMemory> {
        uassert!(!self.base.is_null());

        let pages = bytes.div_ceil(PAGE_BYTES) as u16;
        let first = self.map.find_free_run(pages, strategy).ok_or(OutOfMemory)?;
        self.map.mark_run_used(first, pages);

        // Safety: the run lies within the map, and the map covers exactly
        // the region `base` was initialized with.
        let ptr = unsafe { self.base.add(usize::from(first) * PAGE_BYTES) };
        Ok((ptr, usize::from(pages) * PAGE_BYTES))
    }

    /// Returns the page range covering `ptr .. ptr + bytes` to the free
    /// pool. `ptr` must be the base of a range previously returned by
    /// [`Heap::allocate`], with its original requested size.
    pub(crate) fn free(&mut self, ptr: *mut u8, bytes: usize) {
        let offset = ptr as usize - self.base as usize;
        uassert!(offset % PAGE_BYTES == 0);

        let first = (offset / PAGE_BYTES) as u16;
        let pages = bytes.div_ceil(PAGE_BYTES) as u16;
        uassert!(first + pages <= self.map.total_pages());

        self.map.mark_run_free(first, pages);
    }

    /// Moves an allocation to a new range of at least `new_bytes`, copying
    /// the lesser of the old and new sizes and freeing the old range.
    ///
    /// The old range stays marked used while the new one is found, so the
    /// two never overlap; on failure the old allocation is untouched.
    pub(crate) fn reallocate(
        &mut self,
        ptr: *mut u8,
        old_bytes: usize,
        new_bytes: usize,
        strategy: SearchStrategy,
    ) -> Result<(*mut u8, usize), OutOfMemory> {
        let (new_ptr, actual) = self.allocate(new_bytes, strategy)?;
        // Safety: both ranges are inside the region and cannot overlap,
        // since the old range was still marked used during the search.
        unsafe {
            core::ptr::copy_nonoverlapping(
                ptr,
                new_ptr,
                old_bytes.min(new_bytes),
            );
        }
        self.free(ptr, old_bytes);
        Ok((new_ptr, actual))
    }

    pub(crate) fn free_bytes(&self) -> usize {
        usize::from(self.map.free_pages()) * PAGE_BYTES
    }

    pub(crate) fn used_bytes(&self) -> usize {
        usize::from(self.map.used_pages()) * PAGE_BYTES
    }
}

struct HeapCell(UnsafeCell<Heap>);

// Safety: only touched with interrupts masked on a single core; see
// `with_heap`.
unsafe impl Sync for HeapCell {}

static HEAP: HeapCell = HeapCell(UnsafeCell::new(Heap::empty()));

/// Backing storage for the heap region.
struct RegionCell(UnsafeCell<[u8; HEAP_BYTES]>);

// Safety: handed to the allocator exactly once, at startup; all access
// after that goes through allocator-granted ranges.
unsafe impl Sync for RegionCell {}

static HEAP_MEM: RegionCell = RegionCell(UnsafeCell::new([0; HEAP_BYTES]));

/// Wires the allocator to its backing region.
///
/// # Safety
///
/// Must be called exactly once, before any allocation, with interrupts
/// masked.
pub(crate) unsafe fn init() {
    // Safety: per our own contract, nothing else is running yet.
    unsafe {
        (*HEAP.0.get()).init(HEAP_MEM.0.get() as *mut u8);
    }
}

/// Runs `body` with the allocator locked (interrupts masked).
pub(crate) fn with_heap<R>(body: impl FnOnce(&mut Heap) -> R) -> R {
    crate::arch::atomic(|| {
        // Safety: interrupts are masked and this is a single-core machine,
        // so the reference is exclusive for the duration of `body`.
        let heap = unsafe { &mut *HEAP.0.get() };
        body(heap)
    })
}

/// Allocates at least `bytes` bytes of page-granular memory, returning the
/// base address and the actual size granted.
pub fn allocate(
    bytes: usize,
    strategy: SearchStrategy,
) -> Result<(*mut u8, usize), OutOfMemory> {
    with_heap(|heap| heap.allocate(bytes, strategy))
}

/// Returns an allocation. Behavior is undefined (in the resource-accounting
/// sense, not the language sense) if the range was not previously granted.
pub fn free(ptr: *mut u8, bytes: usize) {
    with_heap(|heap| heap.free(ptr, bytes))
}

/// Grows or shrinks an allocation, possibly moving it.
pub fn reallocate(
    ptr: *mut u8,
    old_bytes: usize,
    new_bytes: usize,
    strategy: SearchStrategy,
) -> Result<(*mut u8, usize), OutOfMemory> {
    with_heap(|heap| heap.reallocate(ptr, old_bytes, new_bytes, strategy))
}

/// Bytes currently free, across all fragments.
pub fn free_bytes() -> usize {
    with_heap(|heap| heap.free_bytes())
}

/// Bytes currently allocated.
pub fn used_bytes() -> usize {
    with_heap(|heap| heap.used_bytes())
}
