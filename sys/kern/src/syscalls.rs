// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel call surface.
//!
//! There is no privilege boundary on this machine -- threads and kernel
//! share one flat address space -- so "system calls" are ordinary function
//! calls. What makes them kernel calls is the locking discipline: each one
//! masks interrupts around its access to kernel state, which on a single
//! core is the whole of mutual exclusion.
//!
//! Operations that target another thread take a [`ThreadId`] and are
//! generation-checked: if the designated thread has terminated (or its slot
//! has been recycled into a different thread), the operation quietly does
//! nothing and reports accordingly. It is never an error to hold a stale
//! id, only useless.
//!
//! The single blocking operation is [`wait`]; everything else returns
//! promptly. [`signal`] is additionally safe to call from interrupt
//! handlers, which is how drivers complete I/O.

use abi::{
    SignalSet, Synapse, ThreadEntry, ThreadFlags, ThreadId, ThreadStatus,
    SIG_START, SIG_STOP,
};
use unwrap_lite::UnwrapLite;

use crate::err::SpawnError;
use crate::sched::{self, with_kernel};
use crate::thread::current_id;
use crate::time::Timestamp;

/// Creates a new thread.
///
/// The stack is taken from the page allocator, top-down, and is at least
/// [`crate::config::MIN_STACK_BYTES`] regardless of `stack_bytes`. With
/// [`ThreadFlags::READY`] the thread is queued to run immediately;
/// otherwise it sits idle until something signals it onto a ready list.
///
/// `term_synapse`, if given, is fired when the thread returns from `entry`;
/// `exit_dest`, if non-null, receives the entry function's return value at
/// the same moment. The pointer must stay valid for the thread's lifetime.
pub fn create(
    name: &'static str,
    stack_bytes: usize,
    entry: ThreadEntry,
    flags: ThreadFlags,
    term_synapse: Option<Synapse>,
    exit_dest: *mut i16,
) -> Result<ThreadId, SpawnError> {
    with_kernel(|k| {
        crate::mem::with_heap(|heap| {
            k.create_thread(
                heap,
                name,
                stack_bytes,
                Some(entry),
                flags,
                term_synapse,
                exit_dest,
            )
        })
    })
}

/// Takes a thread from the recycling pool and sets it running `entry`.
///
/// The reanimated thread is prepended to the active list, so it runs at
/// the next switch. Returns `None` if the pool is empty; it refills as
/// pool threads terminate.
pub fn from_pool(
    name: &'static str,
    entry: ThreadEntry,
    term_synapse: Option<Synapse>,
    exit_dest: *mut i16,
) -> Option<ThreadId> {
    with_kernel(|k| k.pool_thread(name, entry, term_synapse, exit_dest))
}

/// Waits for any of the signals in `sigs`, with an optional timeout in
/// milliseconds (`0` for none), and returns the signal(s) that fired.
///
/// House rules, all load-bearing:
///
/// - Only bits the thread has allocated can be waited on; others are
///   silently dropped from the mask. If nothing waitable remains, returns
///   the empty set without blocking.
/// - Unless `sigs` includes [`SIG_START`], the kernel adds [`SIG_STOP`] to
///   the mask, so a stop is always observable.
/// - With a timeout, [`abi::SIG_TIMEOUT`] joins the mask and fires if
///   nothing else does within `timeout_ms` milliseconds.
/// - Signals already pending satisfy the wait immediately, without
///   yielding. N raises of a bit between two waits look like one.
/// - Fired bits are consumed (cleared from the pending set) on the way
///   out; the rest stay pending.
/// - If [`SIG_STOP`] is among the fired bits, the thread parks itself in a
///   wait for [`SIG_START`] before returning. Stopping is not a scheduler
///   state; it is this line.
pub fn wait(sigs: SignalSet, timeout_ms: u32) -> SignalSet {
    let token = crate::arch::disable_interrupts();

    // Safety: interrupts stay masked from here until we either restore
    // them or hand off through the blocking switch, so the reference is
    // exclusive.
    let k = unsafe { sched::kernel_mut() };

    let Some(cur) = k.current else {
        // No thread context to block; this is setup code calling too
        // early.
        crate::arch::restore_interrupts(token);
        return SignalSet::EMPTY;
    };

    if !k.threads[cur].prepare_wait(sigs, timeout_ms) {
        crate::arch::restore_interrupts(token);
        return SignalSet::EMPTY;
    }

    if k.threads[cur].active_signals().is_empty() {
        // Nothing has fired yet: block. This thread will continue from
        // the switch when a signal makes it runnable again, with
        // interrupts enabled by the restore path; mask them again to
        // finish up atomically.
        crate::arch::yield_switch();
        let _ = crate::arch::disable_interrupts();
    }

    // Safety: masked again; note the pre-switch reference is not reused.
    let k = unsafe { sched::kernel_mut() };
    let fired = k.threads[cur].consume_wake();

    crate::arch::restore_interrupts(token);

    // The hidden auto-stop: a stopped thread is simply one waiting here,
    // inside its own wait, for SIG_START.
    if fired.intersects(SIG_STOP) {
        let _ = wait(SIG_START, 0);
    }

    fired
}

/// Sleeps the calling thread for `ms` milliseconds.
pub fn delay(ms: u32) {
    let _ = wait(SignalSet::EMPTY, ms);
}

/// Raises signals on another thread, waking it if it was waiting on any of
/// them. A woken thread goes to the *head* of the active list and gets the
/// CPU at the next switch -- this is the kernel's entire priority scheme.
///
/// Bits the target never allocated are dropped; a stale or dead `target`
/// makes the whole call a no-op. Callable from interrupt handlers.
pub fn signal(target: ThreadId, sigs: SignalSet) {
    with_kernel(|k| {
        if let Some(index) = k.check_id(target) {
            k.post_signals(index, sigs);
        }
    })
}

/// Fires a synapse: raises its mask on its target thread.
pub fn signal_synapse(synapse: Synapse) {
    signal(synapse.target, synapse.mask);
}

/// Reserves a signal bit for the calling thread, returning its one-hot
/// mask. Pass a specific bit number to request exactly that bit, or `None`
/// to take the lowest free one. Returns `None` when the request cannot be
/// met.
pub fn allocate_signal(hint: Option<u16>) -> Option<SignalSet> {
    with_kernel(|k| {
        let cur = k.current?;
        k.threads[cur].allocate_signal(hint)
    })
}

/// Returns signal bits to the calling thread's free set. Requests to free
/// the kernel-reserved bits are silently suppressed.
pub fn free_signals(sigs: SignalSet) {
    with_kernel(|k| {
        if let Some(cur) = k.current {
            k.threads[cur].free_signals(sigs);
        }
    })
}

/// Clears pending signal bits on the calling thread and returns the ones
/// still pending.
pub fn clear_signals(sigs: SignalSet) -> SignalSet {
    with_kernel(|k| match k.current {
        Some(cur) => k.threads[cur].clear_signals(sigs),
        None => SignalSet::EMPTY,
    })
}

/// The subset of pending signals the calling thread's last-set waiting
/// mask would consume -- the ones that would wake it right now.
pub fn active_signals() -> SignalSet {
    with_kernel(|k| match k.current {
        Some(cur) => k.threads[cur].active_signals(),
        None => SignalSet::EMPTY,
    })
}

/// The calling thread's pending (raised, unconsumed) signals.
pub fn current_signals() -> SignalSet {
    with_kernel(|k| match k.current {
        Some(cur) => k.threads[cur].current_signals(),
        None => SignalSet::EMPTY,
    })
}

/// The calling thread's allocated signals, optionally excluding the
/// kernel-reserved bits.
pub fn allocated_signals(user_only: bool) -> SignalSet {
    with_kernel(|k| match k.current {
        Some(cur) => k.threads[cur].allocated_signals(user_only),
        None => SignalSet::EMPTY,
    })
}

/// The id of the calling thread.
///
/// # Panics
///
/// If called before the scheduler has started; there is no calling thread
/// to name yet.
pub fn current() -> ThreadId {
    with_kernel(|k| {
        let cur = k.current.unwrap_lite();
        current_id(&k.threads, cur)
    })
}

/// The name of the calling thread. Same rules as [`current`].
pub fn current_name() -> &'static str {
    with_kernel(|k| {
        let cur = k.current.unwrap_lite();
        k.threads[cur].name()
    })
}

/// Reports a thread's scheduling state, or `None` if the id is stale.
pub fn status(id: ThreadId) -> Option<ThreadStatus> {
    with_kernel(|k| {
        let index = k.check_id(id)?;
        Some(k.threads[index].status(k.current == Some(index)))
    })
}

/// A thread's name, or `None` if the id is stale.
pub fn thread_name(id: ThreadId) -> Option<&'static str> {
    with_kernel(|k| Some(k.threads[k.check_id(id)?].name()))
}

/// A thread's stack size in bytes, or `None` if the id is stale.
pub fn stack_size(id: ThreadId) -> Option<usize> {
    with_kernel(|k| Some(k.threads[k.check_id(id)?].stack_size()))
}

/// A thread's peak stack usage in bytes, as recorded at context saves.
pub fn stack_peak(id: ThreadId) -> Option<usize> {
    with_kernel(|k| Some(k.threads[k.check_id(id)?].stack_peak()))
}

/// A thread's stack usage at its last suspension, in bytes.
pub fn stack_used(id: ThreadId) -> Option<usize> {
    with_kernel(|k| Some(k.threads[k.check_id(id)?].stack_used()))
}

/// Pauses a thread at its current wait, if it is in one. A thread that is
/// not waiting cannot be stopped -- there is nowhere to park it -- and the
/// request is dropped.
pub fn stop(id: ThreadId) {
    with_kernel(|k| {
        if let Some(index) = k.check_id(id) {
            if k.threads[index].waiting_signals().intersects(SIG_STOP) {
                k.post_signals(index, SIG_STOP);
            }
        }
    })
}

/// Resumes a stopped thread. Dropped if the thread is not stopped.
pub fn restart(id: ThreadId) {
    with_kernel(|k| {
        if let Some(index) = k.check_id(id) {
            if k.threads[index].waiting_signals().intersects(SIG_START) {
                k.post_signals(index, SIG_START);
            }
        }
    })
}

/// Switches context switching off. Interrupts still run (and may raise
/// signals); the preemption handler just declines to switch until
/// [`permit`]. Not a counting lock: one `permit` undoes any number of
/// `forbid`s.
pub fn forbid() {
    with_kernel(|k| k.set_switching_enabled(false));
}

/// Switches context switching back on.
pub fn permit() {
    with_kernel(|k| k.set_switching_enabled(true));
}

/// Whether context switching is currently enabled.
pub fn switching_enabled() -> bool {
    with_kernel(|k| k.is_switching_enabled())
}

/// Milliseconds since reset, as an atomic snapshot. Wraps after ~49 days;
/// see [`Timestamp`] for deadline arithmetic that tolerates this.
pub fn now() -> Timestamp {
    with_kernel(|k| k.millis()).into()
}
