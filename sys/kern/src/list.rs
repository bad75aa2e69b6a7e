// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive thread lists over the thread table.
//!
//! Threads are never owned by a list. Each thread slot carries a single pair
//! of next/prev *indices* into the thread table plus a [`ListId`]
//! discriminator naming the list it currently inhabits. Because there is
//! exactly one set of links per thread, a thread can be on at most one list
//! at a time; the discriminator lets us assert that instead of hoping.
//!
//! Two flavors exist. [`List`] is a plain doubly-linked queue used for the
//! ready lists and the pool. [`OffsetList`] keeps its members sorted by
//! expiry time, but stores each member's *delta* from its predecessor rather
//! than an absolute deadline, so that the millisecond tick only ever touches
//! the head.

use crate::thread::Thread;

/// Sentinel index meaning "no thread."
pub(crate) const NIL: u16 = u16::MAX;

/// Names the list a thread currently inhabits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ListId {
    /// Not on any list. This is the state of the currently executing
    /// thread, of the idle thread, and of free slots.
    None,
    /// One of the two ready queues. Which is "active" and which is
    /// "expired" rotates; see the scheduler.
    ReadyA,
    ReadyB,
    /// Recyclable threads awaiting code to run.
    Pool,
    /// Threads sleeping on a timeout.
    Timeout,
}

/// Per-thread linkage, embedded in each thread slot.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Links {
    pub(crate) next: u16,
    pub(crate) prev: u16,
    pub(crate) home: ListId,
}

impl Links {
    pub(crate) const DETACHED: Links = Links {
        next: NIL,
        prev: NIL,
        home: ListId::None,
    };
}

/// A doubly-linked queue of thread indices with O(1) append, prepend, and
/// remove.
#[derive(Debug)]
pub(crate) struct List {
    id: ListId,
    head: u16,
    tail: u16,
}

impl List {
    pub(crate) const fn new(id: ListId) -> Self {
        Self {
            id,
            head: NIL,
            tail: NIL,
        }
    }

    pub(crate) fn head(&self) -> Option<usize> {
        if self.head == NIL {
            None
        } else {
            Some(usize::from(self.head))
        }
    }

    /// Adds `index` at the tail.
    ///
    /// # Panics
    ///
    /// If the thread is already on a list.
    pub(crate) fn append(&mut self, threads: &mut [Thread], index: usize) {
        let i = index as u16;
        uassert!(threads[index].links.home == ListId::None);

        threads[index].links = Links {
            next: NIL,
            prev: self.tail,
            home: self.id,
        };
        if self.tail == NIL {
            self.head = i;
        } else {
            threads[usize::from(self.tail)].links.next = i;
        }
        self.tail = i;
    }

    /// Adds `index` at the head.
    ///
    /// # Panics
    ///
    /// If the thread is already on a list.
    pub(crate) fn prepend(&mut self, threads: &mut [Thread], index: usize) {
        let i = index as u16;
        uassert!(threads[index].links.home == ListId::None);

        threads[index].links = Links {
            next: self.head,
            prev: NIL,
            home: self.id,
        };
        if self.head == NIL {
            self.tail = i;
        } else {
            threads[usize::from(self.head)].links.prev = i;
        }
        self.head = i;
    }

    /// Inserts `index` immediately before `at`, which must be a member.
    ///
    /// # Panics
    ///
    /// If the thread is already on a list, or `at` is not on this one.
    pub(crate) fn insert_before(
        &mut self,
        threads: &mut [Thread],
        at: usize,
        index: usize,
    ) {
        uassert!(threads[at].links.home == self.id);

        let prev = threads[at].links.prev;
        if prev == NIL {
            self.prepend(threads, index);
        } else {
            let i = index as u16;
            uassert!(threads[index].links.home == ListId::None);

            threads[index].links = Links {
                next: at as u16,
                prev,
                home: self.id,
            };
            threads[usize::from(prev)].links.next = i;
            threads[at].links.prev = i;
        }
    }

    /// Unlinks `index` from this list.
    ///
    /// # Panics
    ///
    /// If the thread is not on this list.
    pub(crate) fn remove(&mut self, threads: &mut [Thread], index: usize) {
        uassert!(threads[index].links.home == self.id);

        let Links { next, prev, .. } = threads[index].links;
        if prev == NIL {
            self.head = next;
        } else {
            threads[usize::from(prev)].links.next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            threads[usize::from(next)].links.prev = prev;
        }
        threads[index].links = Links::DETACHED;
    }

    /// Detaches and returns the head, if any.
    pub(crate) fn pop_head(&mut self, threads: &mut [Thread]) -> Option<usize> {
        let head = self.head()?;
        self.remove(threads, head);
        Some(head)
    }

    /// Iterates the member indices from head to tail, for inspection.
    pub(crate) fn iter<'a>(&self, threads: &'a [Thread]) -> Iter<'a> {
        Iter {
            next: self.head,
            threads,
        }
    }
}

pub(crate) struct Iter<'a> {
    next: u16,
    threads: &'a [Thread],
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == NIL {
            return None;
        }
        let index = usize::from(self.next);
        self.next = self.threads[index].links.next;
        Some(index)
    }
}

/// The timeout queue: a [`List`] kept sorted by expiry, where each member's
/// `timeout_offset` is the tick delta from its predecessor. The sum of
/// offsets from the head up to and including a member equals that member's
/// absolute timeout.
#[derive(Debug)]
pub(crate) struct OffsetList {
    list: List,
}

impl OffsetList {
    pub(crate) const fn new() -> Self {
        Self {
            list: List::new(ListId::Timeout),
        }
    }

    pub(crate) fn head(&self) -> Option<usize> {
        self.list.head()
    }

    /// Inserts `index` so that it expires `ticks` from now.
    ///
    /// Walks from the head, spending the delta against each predecessor;
    /// whatever remains becomes the new member's own offset, and the
    /// follower's offset shrinks by the same amount so its absolute expiry
    /// is unchanged.
    pub(crate) fn insert_by_offset(
        &mut self,
        threads: &mut [Thread],
        index: usize,
        ticks: u32,
    ) {
        let mut remaining = ticks;
        let mut cursor = self.list.head();

        loop {
            match cursor {
                None => {
                    self.list.append(threads, index);
                    break;
                }
                Some(at) => {
                    let offset = threads[at].timeout_offset;
                    if offset <= remaining {
                        remaining -= offset;
                        let next = threads[at].links.next;
                        cursor = if next == NIL {
                            None
                        } else {
                            Some(usize::from(next))
                        };
                    } else {
                        threads[at].timeout_offset = offset - remaining;
                        self.list.insert_before(threads, at, index);
                        break;
                    }
                }
            }
        }

        threads[index].timeout_offset = remaining;
    }

    /// Unlinks `index`, giving its remaining delta to its successor so the
    /// successor's absolute expiry is unchanged.
    pub(crate) fn remove(&mut self, threads: &mut [Thread], index: usize) {
        let next = threads[index].links.next;
        if next != NIL {
            threads[usize::from(next)].timeout_offset +=
                threads[index].timeout_offset;
        }
        self.list.remove(threads, index);
    }

    #[cfg(test)]
    pub(crate) fn iter<'a>(&self, threads: &'a [Thread]) -> Iter<'a> {
        self.list.iter(threads)
    }
}
