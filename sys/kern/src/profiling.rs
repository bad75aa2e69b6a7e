// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel online profiling support.
//!
//! This is intended to help measure the timing of kernel events -- tick
//! handling, context switch rate, thread turnover -- as an aid to debugging
//! or optimization work.
//!
//! The kernel does not assume any particular way of getting the information
//! out. Instead, a target that wants profiling populates an [`EventsTable`]
//! and hands it to [`configure_events_table`] from its startup code. A
//! typical implementation sets and clears GPIOs, where a logic analyzer can
//! see them; a fancier one might feed counters readable over the wire. Keep
//! the handlers fast, and never block in one.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Hooks that must be provided by the board setup code if it wants to
/// enable kernel profiling.
///
/// If you provide an `EventsTable`, you have to provide every hook; stub
/// the ones you don't care about with `|| ()` equivalents. This eliminates
/// a null check per *implemented* event, and implemented events are
/// expected to be the common case.
pub struct EventsTable {
    /// Called whenever the current thread changes, with the table index of
    /// the incoming thread.
    pub context_switch: fn(usize),
    /// Called on entry to the millisecond tick handler.
    pub timer_isr_enter: fn(),
    /// Called on exit from the millisecond tick handler.
    pub timer_isr_exit: fn(),
    /// Called on entry to the preemption interrupt, switch or not.
    pub preempt_isr_enter: fn(),
    /// Called on exit from the preemption interrupt.
    pub preempt_isr_exit: fn(),
    /// Called when a thread returns from its entry function, with its
    /// table index.
    pub thread_exit: fn(usize),
    /// Called when a thread is caught having overrun its stack.
    pub stack_overflow: fn(usize),
}

/// Supplies the kernel with an events table.
///
/// You can call this more than once if you need to, though that seems odd
/// at first glance.
pub fn configure_events_table(table: &'static EventsTable) {
    EVENTS_TABLE.store(table as *const _ as *mut _, Ordering::Relaxed);
}

/// Internal pointer written by `configure_events_table` and read by
/// `table`. If this is null, no event table has been provided.
///
/// All accesses use `Relaxed` ordering: the table is written once at
/// startup and read many times, and memory barriers are not free.
static EVENTS_TABLE: AtomicPtr<EventsTable> =
    AtomicPtr::new(core::ptr::null_mut());

fn table() -> Option<&'static EventsTable> {
    let p = EVENTS_TABLE.load(Ordering::Relaxed);
    if p.is_null() {
        None
    } else {
        // We only write this pointer from a valid `&'static`, and we're
        // handing out a shared reference, so this should be ok...
        unsafe { Some(&*p) }
    }
}

pub(crate) fn event_context_switch(index: usize) {
    if let Some(t) = table() {
        (t.context_switch)(index)
    }
}

pub(crate) fn event_timer_isr_enter() {
    if let Some(t) = table() {
        (t.timer_isr_enter)()
    }
}

pub(crate) fn event_timer_isr_exit() {
    if let Some(t) = table() {
        (t.timer_isr_exit)()
    }
}

pub(crate) fn event_preempt_isr_enter() {
    if let Some(t) = table() {
        (t.preempt_isr_enter)()
    }
}

pub(crate) fn event_preempt_isr_exit() {
    if let Some(t) = table() {
        (t.preempt_isr_exit)()
    }
}

pub(crate) fn event_thread_exit(index: usize) {
    if let Some(t) = table() {
        (t.thread_exit)(index)
    }
}

pub(crate) fn event_stack_overflow(index: usize) {
    if let Some(t) = table() {
        (t.stack_overflow)(index)
    }
}
