// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of threads.
//!
//! The fields of [`Thread`] are private to this module so that the kernel's
//! invariants can be maintained in one place. The two load-bearing ones:
//!
//! - `waiting_signals` is always a subset of `allocated_signals`; a thread
//!   cannot wait on bits it does not own.
//! - The kernel-reserved signal bits are allocated on every live thread and
//!   can never be freed.
//!
//! Scheduling decisions live in `sched`; this module only knows how one
//! thread's state responds to events.

use abi::{
    Generation, SignalSet, Synapse, ThreadEntry, ThreadFlags, ThreadStatus,
    NUM_RESERVED_SIGNALS, SIGNAL_BITS, SIG_ALL_RESERVED, SIG_START, SIG_STOP,
    SIG_TIMEOUT,
};

use crate::list::Links;

/// Internal representation of a thread: its control block.
///
/// Slots of this type make up the kernel's thread table. A slot is recycled
/// through *reanimation*: the stack range survives, the generation number
/// advances, and everything else is rebuilt from scratch.
pub struct Thread {
    /// Lowest address of the thread's stack.
    stack_base: usize,
    /// Stack length in bytes; the stack occupies
    /// `stack_base..stack_base + stack_size`.
    stack_size: usize,
    /// Stack pointer captured at the last suspension. Valid only while the
    /// thread is not executing.
    saved_sp: usize,
    /// Lowest value `saved_sp` has taken on this incarnation, for overflow
    /// detection and peak-usage reporting.
    low_sp: usize,

    /// Incremented on every reanimation of this slot; stale `ThreadId`s are
    /// detected by comparing against this.
    generation: Generation,
    /// Thread name, referencing an immutable string in program memory.
    name: &'static str,

    /// Creation-time behavior flags.
    flags: ThreadFlags,
    /// Fired when the thread returns from its entry function, if set.
    term_synapse: Option<Synapse>,
    /// Where to store the exit code, if anywhere.
    exit_dest: *mut i16,

    /// Signal bits reserved by this thread. The reserved bits are always
    /// set here.
    allocated_signals: SignalSet,
    /// Signal bits the thread is currently blocked on. Empty iff runnable.
    waiting_signals: SignalSet,
    /// Signal bits raised but not yet consumed by a wait.
    current_signals: SignalSet,

    /// Ticks left in the current quantum; refilled on dispatch.
    pub(crate) quantum_remaining: u8,
    /// While on the timeout list, the tick delta from the predecessor node.
    pub(crate) timeout_offset: u32,
    /// Linkage for the (at most one) list this thread is on.
    pub(crate) links: Links,

    /// Whether this slot holds a thread at all.
    live: bool,
}

impl Thread {
    /// An unoccupied slot.
    pub(crate) const fn empty() -> Self {
        Self {
            stack_base: 0,
            stack_size: 0,
            saved_sp: 0,
            low_sp: 0,
            generation: Generation::ZERO,
            name: "",
            flags: ThreadFlags::empty(),
            term_synapse: None,
            exit_dest: core::ptr::null_mut(),
            allocated_signals: SignalSet::EMPTY,
            waiting_signals: SignalSet::EMPTY,
            current_signals: SignalSet::EMPTY,
            quantum_remaining: 0,
            timeout_offset: 0,
            links: Links::DETACHED,
            live: false,
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live
    }

    /// Claims this slot and records the creation parameters, without
    /// fabricating a stack. Pool threads sit in this half-built state until
    /// `from_pool` reanimates them.
    pub(crate) fn claim(
        &mut self,
        name: &'static str,
        flags: ThreadFlags,
        term_synapse: Option<Synapse>,
        exit_dest: *mut i16,
    ) {
        uassert!(!self.live);
        self.live = true;
        self.generation = self.generation.next();
        self.name = name;
        self.flags = flags;
        self.term_synapse = term_synapse;
        self.exit_dest = exit_dest;
        self.allocated_signals = SIG_ALL_RESERVED;
        self.waiting_signals = SignalSet::EMPTY;
        self.current_signals = SignalSet::EMPTY;
    }

    /// Releases this slot entirely. The caller is responsible for having
    /// freed the stack.
    ///
    /// The generation number survives, so ids naming the departed thread
    /// stay dead no matter who occupies the slot next.
    pub(crate) fn release(&mut self) {
        uassert!(self.links.home == crate::list::ListId::None);
        let generation = self.generation;
        *self = Self::empty();
        self.generation = generation;
    }

    pub(crate) fn set_stack(&mut self, base: usize, size: usize) {
        self.stack_base = base;
        self.stack_size = size;
    }

    /// Rewrites this slot's state so it behaves as a freshly created thread
    /// while keeping its pre-allocated stack: new generation, new name and
    /// entry, reserved signals only, and a stack fabricated so the first
    /// context restore lands in the trampoline.
    ///
    /// `index` is this thread's own position in the thread table; it rides
    /// the fabricated frame into the trampoline.
    pub(crate) fn reanimate(
        &mut self,
        index: usize,
        name: &'static str,
        entry: ThreadEntry,
        flags: ThreadFlags,
        term_synapse: Option<Synapse>,
        exit_dest: *mut i16,
    ) {
        uassert!(self.links.home == crate::list::ListId::None);
        uassert!(self.stack_size != 0);

        self.live = true;
        self.generation = self.generation.next();
        self.name = name;
        self.flags = flags;
        self.term_synapse = term_synapse;
        self.exit_dest = exit_dest;

        self.allocated_signals = SIG_ALL_RESERVED;
        self.waiting_signals = SignalSet::EMPTY;
        self.current_signals = SignalSet::EMPTY;
        self.timeout_offset = 0;
        self.quantum_remaining = 0;

        self.saved_sp = crate::arch::fabricate_stack(
            self.stack_base,
            self.stack_size,
            index as u16,
            entry,
        );
        self.low_sp = self.saved_sp;
    }

    /// Posts a set of signal bits to this thread, keeping only the ones it
    /// has allocated. Returns `true` if the thread was not previously
    /// signalable and now is -- i.e. if the caller needs to move it to the
    /// head of the active list.
    #[must_use]
    pub(crate) fn post(&mut self, sigs: SignalSet) -> bool {
        let was_signalable = !self.active_signals().is_empty();
        self.current_signals |= sigs & self.allocated_signals;
        !was_signalable && !self.active_signals().is_empty()
    }

    /// Builds the waiting mask for a `wait(sigs, timeout)` call and stores
    /// it. Returns `false` if the resulting mask came out empty, in which
    /// case the wait must return immediately without blocking.
    pub(crate) fn prepare_wait(
        &mut self,
        sigs: SignalSet,
        timeout: u32,
    ) -> bool {
        self.waiting_signals = sigs;

        // A stop must always be observable -- except while we are waiting
        // for the start signal itself, which is what "stopped" means.
        if !sigs.intersects(SIG_START) {
            self.waiting_signals |= SIG_STOP;
        }

        self.timeout_offset = timeout;
        if timeout > 0 {
            self.waiting_signals |= SIG_TIMEOUT;
        } else {
            // Force the flag off in case the caller named it without
            // supplying a timeout.
            self.waiting_signals &= !SIG_TIMEOUT;
        }

        // A thread can wait only on signals it has allocated.
        self.waiting_signals &= self.allocated_signals;

        if self.waiting_signals.is_empty() {
            self.timeout_offset = 0;
            false
        } else {
            true
        }
    }

    /// The signals that would wake this thread right now.
    pub(crate) fn active_signals(&self) -> SignalSet {
        self.current_signals & self.waiting_signals
    }

    /// Concludes a wait: consumes the fired bits so repeats of them are
    /// visible later, clears the waiting mask, and disarms any residual
    /// timeout. Returns the bits that fired.
    pub(crate) fn consume_wake(&mut self) -> SignalSet {
        let fired = self.active_signals();
        self.current_signals &= !fired;
        self.waiting_signals = SignalSet::EMPTY;
        self.timeout_offset = 0;
        fired
    }

    fn try_allocate_signal(&mut self, number: u16) -> Option<SignalSet> {
        let mask = SignalSet::bit(number);
        if self.allocated_signals.intersects(mask) {
            None
        } else {
            self.allocated_signals |= mask;
            Some(mask)
        }
    }

    /// Reserves a signal bit for this thread and returns its one-hot mask.
    ///
    /// With a hint below [`SIGNAL_BITS`], only that specific bit is
    /// attempted; otherwise the lowest free non-reserved bit is taken.
    /// Returns `None` when nothing is available.
    pub(crate) fn allocate_signal(
        &mut self,
        hint: Option<u16>,
    ) -> Option<SignalSet> {
        match hint {
            Some(number) if number < SIGNAL_BITS => {
                self.try_allocate_signal(number)
            }
            _ => (NUM_RESERVED_SIGNALS..SIGNAL_BITS)
                .find_map(|number| self.try_allocate_signal(number)),
        }
    }

    /// Returns signal bits to this thread's free set. The kernel-reserved
    /// bits are silently excluded.
    pub(crate) fn free_signals(&mut self, sigs: SignalSet) {
        let to_free = sigs & !SIG_ALL_RESERVED;
        self.allocated_signals &= !to_free;
        self.waiting_signals &= !to_free;
        self.current_signals &= !to_free;
    }

    /// Clears raised signal bits and returns the ones still set.
    pub(crate) fn clear_signals(&mut self, sigs: SignalSet) -> SignalSet {
        self.current_signals &= !sigs;
        self.current_signals
    }

    pub(crate) fn current_signals(&self) -> SignalSet {
        self.current_signals
    }

    pub(crate) fn allocated_signals(&self, user_only: bool) -> SignalSet {
        if user_only {
            self.allocated_signals & !SIG_ALL_RESERVED
        } else {
            self.allocated_signals
        }
    }

    pub(crate) fn waiting_signals(&self) -> SignalSet {
        self.waiting_signals
    }

    /// Records the stack pointer at a context save, updating the low-water
    /// mark. Returns `true` if the thread has overrun its stack.
    #[must_use]
    pub(crate) fn note_switch_sp(&mut self, sp: usize) -> bool {
        self.saved_sp = sp;
        self.low_sp = self.low_sp.min(sp);
        self.low_sp < self.stack_base
    }

    pub(crate) fn saved_sp(&self) -> usize {
        self.saved_sp
    }

    pub(crate) fn status(&self, is_current: bool) -> ThreadStatus {
        if is_current {
            ThreadStatus::Running
        } else if !self.waiting_signals.is_empty() {
            if self.waiting_signals.intersects(SIG_START) {
                ThreadStatus::Stopped
            } else {
                ThreadStatus::Waiting
            }
        } else {
            ThreadStatus::Ready
        }
    }

    pub(crate) fn flags(&self) -> ThreadFlags {
        self.flags
    }

    pub(crate) fn term_synapse(&self) -> Option<Synapse> {
        self.term_synapse
    }

    pub(crate) fn exit_dest(&self) -> *mut i16 {
        self.exit_dest
    }

    pub(crate) fn stack_base(&self) -> usize {
        self.stack_base
    }

    /// Returns this thread's current generation number.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns the thread's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the size of the stack, in bytes.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Returns the peak recorded stack usage, in bytes.
    pub fn stack_peak(&self) -> usize {
        self.stack_size
            .saturating_sub(self.low_sp.saturating_sub(self.stack_base))
    }

    /// Returns the stack usage at the last suspension, in bytes. While the
    /// thread is running this lags reality by one context save.
    pub fn stack_used(&self) -> usize {
        self.stack_size
            .saturating_sub(self.saved_sp.saturating_sub(self.stack_base))
    }
}

/// Produces a current `ThreadId` (i.e. one with the correct generation) for
/// `threads[index]`.
pub(crate) fn current_id(threads: &[Thread], index: usize) -> abi::ThreadId {
    abi::ThreadId::for_index_and_gen(index, threads[index].generation())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> i16 {
        0
    }

    fn live_thread() -> Thread {
        let mut t = Thread::empty();
        t.claim("test", ThreadFlags::READY, None, core::ptr::null_mut());
        t.set_stack(0x1000, 256);
        t.reanimate(0, "test", entry, ThreadFlags::READY, None, core::ptr::null_mut());
        t
    }

    #[test]
    fn claimed_threads_start_with_only_reserved_signals() {
        let t = live_thread();
        assert_eq!(t.allocated_signals(false), SIG_ALL_RESERVED);
        assert_eq!(t.allocated_signals(true), SignalSet::EMPTY);
        assert_eq!(t.current_signals(), SignalSet::EMPTY);
    }

    #[test]
    fn signal_allocation_scans_past_reserved_bits() {
        let mut t = live_thread();
        let first = t.allocate_signal(None).unwrap();
        assert_eq!(first, SignalSet::bit(NUM_RESERVED_SIGNALS));
        let second = t.allocate_signal(None).unwrap();
        assert_eq!(second, SignalSet::bit(NUM_RESERVED_SIGNALS + 1));
        assert!(!first.intersects(second));
    }

    #[test]
    fn signal_allocation_honors_hints() {
        let mut t = live_thread();
        assert_eq!(t.allocate_signal(Some(9)), Some(SignalSet::bit(9)));
        // Same bit again: taken.
        assert_eq!(t.allocate_signal(Some(9)), None);
        // Out-of-range hints fall back to scanning.
        assert_eq!(
            t.allocate_signal(Some(99)),
            Some(SignalSet::bit(NUM_RESERVED_SIGNALS))
        );
    }

    #[test]
    fn signal_space_can_be_exhausted() {
        let mut t = live_thread();
        for _ in NUM_RESERVED_SIGNALS..SIGNAL_BITS {
            assert!(t.allocate_signal(None).is_some());
        }
        assert_eq!(t.allocate_signal(None), None);
    }

    #[test]
    fn reserved_signals_cannot_be_freed() {
        let mut t = live_thread();
        let user = t.allocate_signal(None).unwrap();
        t.free_signals(user | SIG_ALL_RESERVED);
        assert_eq!(t.allocated_signals(false), SIG_ALL_RESERVED);
        // The user bit really did go away.
        assert_eq!(t.allocate_signal(None), Some(user));
    }

    #[test]
    fn freeing_a_signal_scrubs_waiting_and_current() {
        let mut t = live_thread();
        let user = t.allocate_signal(None).unwrap();
        assert!(t.prepare_wait(user, 0));
        assert!(t.post(user));
        t.free_signals(user);
        assert_eq!(t.waiting_signals(), SIG_STOP);
        assert_eq!(t.current_signals(), SignalSet::EMPTY);
    }

    #[test]
    fn waiting_mask_is_limited_to_allocated_signals() {
        let mut t = live_thread();
        let user = t.allocate_signal(None).unwrap();
        let bogus = SignalSet::bit(12);
        assert!(t.prepare_wait(user | bogus, 0));
        assert!(t
            .allocated_signals(false)
            .contains(t.waiting_signals()));
        assert!(!t.waiting_signals().intersects(bogus));
    }

    #[test]
    fn wait_on_unallocated_bits_degrades_to_a_stop_wait() {
        let mut t = live_thread();
        // Bit 5 was never allocated, so after masking only the implicit
        // stop remains; the thread still blocks, but only a stop can wake
        // it.
        assert!(t.prepare_wait(SignalSet::bit(5), 0));
        assert_eq!(t.waiting_signals(), SIG_STOP);
    }

    #[test]
    fn implicit_stop_rides_every_ordinary_wait() {
        let mut t = live_thread();
        let user = t.allocate_signal(None).unwrap();
        assert!(t.prepare_wait(user, 0));
        assert!(t.waiting_signals().intersects(SIG_STOP));

        // ...but not a wait for SIG_START, which is the stopped state
        // itself.
        assert!(t.prepare_wait(SIG_START, 0));
        assert!(!t.waiting_signals().intersects(SIG_STOP));
    }

    #[test]
    fn timeout_arms_and_disarms_the_timeout_bit() {
        let mut t = live_thread();
        let user = t.allocate_signal(None).unwrap();
        assert!(t.prepare_wait(user | SIG_TIMEOUT, 0));
        assert!(
            !t.waiting_signals().intersects(SIG_TIMEOUT),
            "naming SIG_TIMEOUT without a timeout must not arm it"
        );
        assert!(t.prepare_wait(user, 25));
        assert!(t.waiting_signals().intersects(SIG_TIMEOUT));
        assert_eq!(t.timeout_offset, 25);
    }

    #[test]
    fn posting_is_idempotent_until_consumed() {
        let mut t = live_thread();
        let user = t.allocate_signal(None).unwrap();
        assert!(t.prepare_wait(user, 0));

        assert!(t.post(user), "first post should wake");
        assert!(!t.post(user), "repeat posts must coalesce");
        assert_eq!(t.consume_wake(), user);

        // After consumption the same bit can fire again.
        assert!(t.prepare_wait(user, 0));
        assert!(t.post(user));
    }

    #[test]
    fn posting_unallocated_bits_is_discarded() {
        let mut t = live_thread();
        assert!(!t.post(SignalSet::bit(9)));
        assert_eq!(t.current_signals(), SignalSet::EMPTY);
    }

    #[test]
    fn consume_wake_clears_only_fired_bits() {
        let mut t = live_thread();
        let a = t.allocate_signal(None).unwrap();
        let b = t.allocate_signal(None).unwrap();
        assert!(t.prepare_wait(a, 0));
        let _ = t.post(a);
        let _ = t.post(b);

        assert_eq!(t.consume_wake(), a);
        // b was raised but not waited on; it stays pending.
        assert_eq!(t.current_signals(), b);
        assert_eq!(t.waiting_signals(), SignalSet::EMPTY);
    }

    #[test]
    fn status_reflects_signal_state() {
        let mut t = live_thread();
        assert_eq!(t.status(true), ThreadStatus::Running);
        assert_eq!(t.status(false), ThreadStatus::Ready);

        let user = t.allocate_signal(None).unwrap();
        assert!(t.prepare_wait(user, 0));
        assert_eq!(t.status(false), ThreadStatus::Waiting);

        assert!(t.prepare_wait(SIG_START, 0));
        assert_eq!(t.status(false), ThreadStatus::Stopped);
    }

    #[test]
    fn watermark_tracks_the_deepest_excursion() {
        let mut t = live_thread();
        assert!(!t.note_switch_sp(0x1080));
        assert!(!t.note_switch_sp(0x1040));
        assert!(!t.note_switch_sp(0x10f0));
        assert_eq!(t.stack_peak(), 256 - 0x40);
        assert_eq!(t.stack_used(), 256 - 0xf0);
    }

    #[test]
    fn overflow_is_detected_at_the_switch_point() {
        let mut t = live_thread();
        assert!(!t.note_switch_sp(0x1000), "exactly at base is still legal");
        assert!(t.note_switch_sp(0x0fff));
        // Once overflowed, the watermark pins the report at full usage.
        assert_eq!(t.stack_peak(), 256);
    }
}
