// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler: ready queues, the timeout queue, preemption, and the
//! thread trampoline.
//!
//! # The two ready lists
//!
//! Round-robin here uses a pair of queues, *active* and *expired*, plus an
//! index saying which is which. Runnable threads are dispatched from the
//! head of the active list; a thread whose quantum runs out goes to the tail
//! of the expired list. When the active list drains, the roles swap. If both
//! are empty, the idle thread runs. The only priority mechanism in the
//! kernel is that a freshly woken thread is *prepended* to the active list,
//! so it runs at the next switch.
//!
//! # Who is on what list
//!
//! The currently executing thread is on no list at all. Neither is the idle
//! thread, nor a thread blocked in a wait without a timeout -- such a thread
//! is reachable only through the `Synapse`s that name it. This makes the
//! "at most one list" rule trivial to audit: ready lists hold runnable
//! threads that are not running, the timeout list holds sleepers, the pool
//! list holds empty vessels.
//!
//! # Interrupts vs. `forbid`
//!
//! Context switching can be suspended with [`crate::syscalls::forbid`],
//! which the preemption interrupt observes after saving minimal state.
//! Forbidding switches does *not* mask interrupts: signals raised by
//! interrupt handlers while switching is forbidden still land in the target
//! thread's signal bits, and the wake is honored at the next permitted
//! switch.

use abi::{SignalSet, ThreadEntry, ThreadFlags, ThreadId, SIG_TIMEOUT};
use unwrap_lite::UnwrapLite;

use crate::config::{self, KernelConfig, MAX_THREADS, QUANTUM_TICKS};
use crate::err::SpawnError;
use crate::list::{List, ListId, OffsetList};
use crate::mem::Heap;
use crate::thread::{current_id, Thread};

/// The kernel's mutable state: the thread table and every queue over it.
///
/// There is exactly one of these, in [`KERNEL`]; it is reachable only with
/// interrupts masked. Tests build their own on the stack.
pub(crate) struct Kernel {
    pub(crate) threads: [Thread; MAX_THREADS],
    /// The two ready queues; `active` selects which is the active one.
    ready: [List; 2],
    active: usize,
    /// Recyclable threads awaiting code to run.
    pool: List,
    /// Sleeping threads, sorted by expiry, storing deltas.
    timeout: OffsetList,
    /// Index of the executing thread. `None` only before the first switch
    /// and in the twilight between a thread's death and the next dispatch.
    pub(crate) current: Option<usize>,
    /// Index of the idle thread, once the startup code has built it.
    idle: Option<usize>,
    /// Free-running millisecond counter. Wraps after ~49 days.
    millis: u32,
    /// Cleared by `forbid`, set by `permit`.
    switching_enabled: bool,
    /// Set when a wake prepended a thread to the active list; tells the
    /// preemption handler to cut the current quantum short.
    wake_pending: bool,
    /// Application-supplied hooks.
    pub(crate) config: KernelConfig,
}

// Several entry points below exist only for the sake of the target's
// interrupt vectors; host builds never reference them.
#[cfg_attr(not(target_arch = "avr"), allow(dead_code))]
impl Kernel {
    pub(crate) const fn new() -> Self {
        const EMPTY: Thread = Thread::empty();
        Self {
            threads: [EMPTY; MAX_THREADS],
            ready: [List::new(ListId::ReadyA), List::new(ListId::ReadyB)],
            active: 0,
            pool: List::new(ListId::Pool),
            timeout: OffsetList::new(),
            current: None,
            idle: None,
            millis: 0,
            switching_enabled: true,
            wake_pending: false,
            config: KernelConfig::DEFAULT,
        }
    }

    pub(crate) fn millis(&self) -> u32 {
        self.millis
    }

    pub(crate) fn is_switching_enabled(&self) -> bool {
        self.switching_enabled
    }

    pub(crate) fn set_switching_enabled(&mut self, enabled: bool) {
        self.switching_enabled = enabled;
    }

    pub(crate) fn set_idle(&mut self, index: usize) {
        self.idle = Some(index);
    }

    /// Checks a user-provided `ThreadId` for validity against the table.
    ///
    /// On success, returns the index of the (live, generation-matching)
    /// thread. On failure -- out of range, empty slot, or stale generation
    /// -- returns `None`. Every id-taking operation goes through here, which
    /// is what makes stale synapses harmless.
    pub(crate) fn check_id(&self, id: ThreadId) -> Option<usize> {
        let index = id.index();
        if index >= self.threads.len() {
            return None;
        }
        let t = &self.threads[index];
        if !t.is_live() || t.generation() != id.generation() {
            return None;
        }
        Some(index)
    }

    /// Raises `sigs` on `threads[index]` and performs the wake if the
    /// thread just became signalable: off the timeout list, onto the *head*
    /// of the active list, and a note to the preemption handler to switch
    /// soon.
    ///
    /// Safe to call from interrupt context (with the kernel locked, as
    /// always).
    pub(crate) fn post_signals(&mut self, index: usize, sigs: SignalSet) {
        let is_current = self.current == Some(index);
        let newly_signalable = self.threads[index].post(sigs);

        if !is_current && newly_signalable {
            // If it's sleeping on the timeout list, the wake cancels the
            // timeout outright.
            if self.threads[index].links.home == ListId::Timeout {
                self.timeout.remove(&mut self.threads, index);
                self.threads[index].timeout_offset = 0;
            }
            uassert!(self.threads[index].links.home == ListId::None);
            self.ready[self.active].prepend(&mut self.threads, index);
            self.wake_pending = true;
        }
    }

    /// Chooses the next thread to run and detaches it from its ready list.
    /// This is the head of the active list; when the active list is empty
    /// the lists swap roles first, and when both are empty the idle thread
    /// runs.
    fn select_next(&mut self) -> usize {
        if let Some(index) = self.ready[self.active].pop_head(&mut self.threads)
        {
            return index;
        }
        self.active ^= 1;
        if let Some(index) = self.ready[self.active].pop_head(&mut self.threads)
        {
            return index;
        }
        self.idle.unwrap_lite()
    }

    /// Makes `index` the current thread and returns the stack pointer to
    /// restore. Tops up the quantum if the thread arrived with none left.
    fn dispatch(&mut self, index: usize) -> usize {
        self.current = Some(index);
        self.wake_pending = false;
        if self.threads[index].quantum_remaining == 0 {
            self.threads[index].quantum_remaining = QUANTUM_TICKS;
        }
        crate::profiling::event_context_switch(index);
        self.threads[index].saved_sp()
    }

    /// Records a context save for `index`, updating the stack watermark and
    /// handling overflow. `sp` is `None` when no machine context was
    /// actually saved (host tests).
    fn note_suspend(&mut self, index: usize, sp: Option<usize>) {
        let Some(sp) = sp else { return };
        if self.threads[index].note_switch_sp(sp) {
            crate::profiling::event_stack_overflow(index);
            let hook = self.config.on_stack_overflow;
            let thread = &self.threads[index];
            crate::arch::with_safe_stack(|| hook(thread));
        }
    }

    /// Voluntary switch away from a blocking thread. The thread keeps no
    /// ready-list position: it goes onto the timeout list if it asked for a
    /// timeout, and otherwise waits wherever its synapses can find it.
    ///
    /// Returns the stack pointer of the thread to run instead.
    pub(crate) fn block_switch(&mut self, sp: Option<usize>) -> usize {
        if let Some(cur) = self.current {
            self.note_suspend(cur, sp);
            let ticks = self.threads[cur].timeout_offset;
            if ticks > 0 {
                self.timeout.insert_by_offset(&mut self.threads, cur, ticks);
            }
        }
        let next = self.select_next();
        self.dispatch(next)
    }

    /// The cheap half of the preemption interrupt: account for the tick and
    /// decide whether a full context switch is warranted.
    ///
    /// A pending wake forces the quantum to zero, so the woken thread (at
    /// the head of the active list) runs at this switch. Nothing is forced
    /// while switching is forbidden.
    pub(crate) fn preempt_tick(&mut self) -> bool {
        let Some(cur) = self.current else {
            return self.switching_enabled;
        };

        let t = &mut self.threads[cur];
        if t.quantum_remaining > 0 {
            t.quantum_remaining -= 1;
        }
        if self.switching_enabled && self.wake_pending {
            t.quantum_remaining = 0;
        }
        self.switching_enabled && t.quantum_remaining == 0
    }

    /// The expensive half of the preemption interrupt, run only when
    /// [`Kernel::preempt_tick`] said to: retire the current thread to the
    /// expired list and dispatch the next.
    ///
    /// The idle thread is never queued; it is re-selected by fallback.
    pub(crate) fn preempt_switch(&mut self, sp: usize) -> usize {
        if let Some(cur) = self.current {
            self.note_suspend(cur, Some(sp));
            if Some(cur) != self.idle {
                self.ready[self.active ^ 1].append(&mut self.threads, cur);
            }
        }
        let next = self.select_next();
        self.dispatch(next)
    }

    /// The millisecond tick: advances kernel time and expires sleepers.
    ///
    /// Only the head of the timeout list is ever decremented; everything
    /// behind it is stored relative. Every head that reaches zero gets
    /// `SIG_TIMEOUT`, which wakes it through the ordinary signal path.
    pub(crate) fn tick_1ms(&mut self) {
        self.millis = self.millis.wrapping_add(1);

        if let Some(head) = self.timeout.head() {
            if self.threads[head].timeout_offset > 0 {
                self.threads[head].timeout_offset -= 1;
            }
            while let Some(head) = self.timeout.head() {
                if self.threads[head].timeout_offset != 0 {
                    break;
                }
                self.timeout.remove(&mut self.threads, head);
                self.post_signals(head, SIG_TIMEOUT);
            }
        }
    }

    /// Creates a thread in a free slot, with a freshly allocated stack.
    ///
    /// Pool threads are parked on the pool list, unanimated, waiting for
    /// [`Kernel::pool_thread`] to give them code; `entry` may be `None` for
    /// them. Everything else is animated immediately and queued if it asked
    /// to be ready.
    pub(crate) fn create_thread(
        &mut self,
        heap: &mut Heap,
        name: &'static str,
        stack_bytes: usize,
        entry: Option<ThreadEntry>,
        flags: ThreadFlags,
        term_synapse: Option<abi::Synapse>,
        exit_dest: *mut i16,
    ) -> Result<ThreadId, SpawnError> {
        let slot = self
            .threads
            .iter()
            .position(|t| !t.is_live())
            .ok_or(SpawnError::NoThreadSlot)?;

        let stack_bytes = stack_bytes.max(config::MIN_STACK_BYTES);
        let (base, actual) = heap
            .allocate(stack_bytes, kerncore::SearchStrategy::TopDown)
            .map_err(SpawnError::from)?;

        self.threads[slot].claim(name, flags, term_synapse, exit_dest);
        self.threads[slot].set_stack(base as usize, actual);

        if flags.contains(ThreadFlags::POOL) {
            self.pool.append(&mut self.threads, slot);
        } else {
            // Creating an unpooled thread without an entry point is a
            // kernel bug, not an application error.
            let entry = entry.unwrap_lite();
            self.threads[slot].reanimate(
                slot,
                name,
                entry,
                flags,
                term_synapse,
                exit_dest,
            );
            if flags.contains(ThreadFlags::READY) {
                self.ready[self.active].append(&mut self.threads, slot);
            }
        }

        Ok(current_id(&self.threads, slot))
    }

    /// Detaches a thread from the pool, reanimates it around `entry`, and
    /// prepends it to the active list so it runs next. Pool threads always
    /// start ready; the READY flag is forced here, not consulted.
    ///
    /// Returns `None` when the pool is empty.
    pub(crate) fn pool_thread(
        &mut self,
        name: &'static str,
        entry: ThreadEntry,
        term_synapse: Option<abi::Synapse>,
        exit_dest: *mut i16,
    ) -> Option<ThreadId> {
        let slot = self.pool.pop_head(&mut self.threads)?;
        self.threads[slot].reanimate(
            slot,
            name,
            entry,
            ThreadFlags::READY | ThreadFlags::POOL,
            term_synapse,
            exit_dest,
        );
        self.ready[self.active].prepend(&mut self.threads, slot);
        Some(current_id(&self.threads, slot))
    }

    /// Tears down the current thread after its entry function returned:
    /// delivers the exit code and termination signal, then re-pools the
    /// slot or releases it and its stack.
    ///
    /// On return, `current` is `None`; the caller must switch away and
    /// never come back.
    pub(crate) fn retire_current(&mut self, heap: &mut Heap, exit_code: i16) {
        let index = self.current.unwrap_lite();
        let departing = current_id(&self.threads, index);
        let flags = self.threads[index].flags();

        if flags.contains(ThreadFlags::POOL) {
            // A recyclable slot must not leak user signals: a leftover
            // allocation means some Synapse out there still names this
            // thread, and the slot's next occupant could be signalled in
            // error through it.
            debug_assert!(
                self.threads[index].allocated_signals(true).is_empty(),
                "signals remain"
            );
        }

        let dest = self.threads[index].exit_dest();
        if !dest.is_null() {
            // Safety: the creator supplied this pointer and is responsible
            // for keeping it valid until the thread terminates, which is
            // happening right now.
            unsafe {
                core::ptr::write(dest, exit_code);
            }
        }

        if let Some(syn) = self.threads[index].term_synapse() {
            if let Some(target) = self.check_id(syn.target) {
                self.post_signals(target, syn.mask);
            }
        }

        // Forget the thread so no context gets saved into the dead stack by
        // the switch that follows.
        uassert!(self.threads[index].links.home == ListId::None);
        self.current = None;

        (self.config.on_thread_exit)(departing, exit_code);
        crate::profiling::event_thread_exit(index);

        if flags.contains(ThreadFlags::POOL) {
            self.pool.append(&mut self.threads, index);
        } else {
            heap.free(
                self.threads[index].stack_base() as *mut u8,
                self.threads[index].stack_size(),
            );
            self.threads[index].release();
        }
    }

    #[cfg(test)]
    pub(crate) fn ready_order(&self, which: usize) -> Vec<usize> {
        self.ready[which].iter(&self.threads).collect()
    }

    #[cfg(test)]
    pub(crate) fn active_index(&self) -> usize {
        self.active
    }
}

/// All threads start and end life here.
///
/// The fabricated initial stack frame lands the first context restore at
/// this function's entry, with the thread's table index and real entry
/// point in the argument registers.
#[cfg_attr(not(target_arch = "avr"), allow(dead_code))]
pub(crate) extern "C" fn thread_entry_trampoline(
    index: u16,
    entry: ThreadEntry,
) -> ! {
    // Run the thread and capture its exit code.
    let exit_code = entry();

    // We don't want to be disturbed while cleaning up. The mask is never
    // undone on this path; the thread we switch to restores its own
    // interrupt state.
    let _ = crate::arch::disable_interrupts();

    // Safety: interrupts are masked and this context never resumes, so the
    // reference cannot outlive our exclusive access.
    let k = unsafe { kernel_mut() };
    uassert!(k.current == Some(usize::from(index)));

    crate::mem::with_heap(|heap| k.retire_current(heap, exit_code));

    // NEXT!
    crate::arch::yield_switch();

    // The dead context is never restored, so the switch cannot return.
    loop {
        crate::arch::wait_for_interrupt();
    }
}

struct KernelCell(core::cell::UnsafeCell<Kernel>);

// Safety: the cell's contents are only ever touched with interrupts masked
// on a single-core machine; see `kernel_mut`.
unsafe impl Sync for KernelCell {}

static KERNEL: KernelCell = KernelCell(core::cell::UnsafeCell::new(Kernel::new()));

/// Produces a reference to the kernel state.
///
/// # Safety
///
/// Interrupts must be masked for the full lifetime of the returned
/// reference, and the caller must not already hold one (kernel code never
/// calls this reentrantly; the interrupt mask keeps ISRs out).
pub(crate) unsafe fn kernel_mut() -> &'static mut Kernel {
    unsafe { &mut *KERNEL.0.get() }
}

/// Runs `body` with the kernel locked (interrupts masked).
pub(crate) fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    crate::arch::atomic(|| {
        // Safety: `atomic` masks interrupts around us, and `body` cannot
        // re-enter `with_kernel` without going through `atomic` again,
        // which is fine -- but it cannot smuggle the reference out.
        let k = unsafe { kernel_mut() };
        body(k)
    })
}

// ---------------------------------------------------------------------------
// Interrupt entry points, called from the arch layer with interrupts masked.

/// Millisecond timer and timeout controller.
#[cfg_attr(not(target_arch = "avr"), allow(dead_code))]
pub(crate) extern "C" fn isr_millisecond_tick() {
    crate::profiling::event_timer_isr_enter();
    // Safety: hardware has interrupts masked in an ISR.
    let k = unsafe { kernel_mut() };
    k.tick_1ms();
    crate::profiling::event_timer_isr_exit();
}

/// First half of the preemption interrupt; returns nonzero if the ISR
/// should go on to save full context and call [`isr_preempt_switch`].
#[cfg_attr(not(target_arch = "avr"), allow(dead_code))]
pub(crate) extern "C" fn isr_preempt_should_switch() -> u8 {
    crate::profiling::event_preempt_isr_enter();
    // Safety: hardware has interrupts masked in an ISR.
    let k = unsafe { kernel_mut() };
    let switch = k.preempt_tick();
    if !switch {
        crate::profiling::event_preempt_isr_exit();
    }
    u8::from(switch)
}

/// Second half of the preemption interrupt: full context is saved at `sp`;
/// returns the stack pointer of the thread to resume.
#[cfg_attr(not(target_arch = "avr"), allow(dead_code))]
pub(crate) extern "C" fn isr_preempt_switch(sp: usize) -> usize {
    // Safety: hardware has interrupts masked in an ISR.
    let k = unsafe { kernel_mut() };
    let next_sp = k.preempt_switch(sp);
    crate::profiling::event_preempt_isr_exit();
    next_sp
}

/// Voluntary switch entry: full context of the blocking thread is saved at
/// `sp`; returns the stack pointer of the thread to resume.
#[cfg_attr(not(target_arch = "avr"), allow(dead_code))]
pub(crate) extern "C" fn isr_block_switch(sp: usize) -> usize {
    // Safety: the yield path masks interrupts before saving context.
    let k = unsafe { kernel_mut() };
    k.block_switch(Some(sp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{SignalSet, SIG_START, SIG_STOP};

    const FAKE_SP: usize = 0x2f00;

    fn nop_entry() -> i16 {
        0
    }

    /// Builds a kernel with an idle thread in slot 0 and `n` ready threads
    /// in slots 1..=n, all with fake stacks well clear of their bases.
    fn kernel_with_threads(n: usize) -> Kernel {
        let mut k = Kernel::new();
        for slot in 0..=n {
            let t = &mut k.threads[slot];
            t.claim("test", ThreadFlags::READY, None, core::ptr::null_mut());
            t.set_stack(0x2000 + slot * 0x100, 0x100);
            t.reanimate(
                slot,
                "test",
                nop_entry,
                ThreadFlags::READY,
                None,
                core::ptr::null_mut(),
            );
        }
        k.set_idle(0);
        for slot in 1..=n {
            k.ready[k.active].append(&mut k.threads, slot);
        }
        k
    }

    /// Allocates a user signal for `slot` and parks it in a blocking wait,
    /// as if it had called `wait` and yielded.
    fn park_waiting(k: &mut Kernel, slot: usize, timeout: u32) -> SignalSet {
        let sig = k.threads[slot].allocate_signal(None).unwrap();
        assert!(k.threads[slot].prepare_wait(sig, timeout));
        assert!(k.threads[slot].active_signals().is_empty());
        // It was on the ready list from setup; a blocking thread is not.
        if k.threads[slot].links.home != ListId::None {
            k.ready[k.active].remove(&mut k.threads, slot);
        }
        let ticks = k.threads[slot].timeout_offset;
        if ticks > 0 {
            k.timeout.insert_by_offset(&mut k.threads, slot, ticks);
        }
        sig
    }

    #[test]
    fn signal_wakes_waiter_to_the_head_of_the_active_list() {
        let mut k = kernel_with_threads(3);
        let sig = park_waiting(&mut k, 1, 0);

        // Thread 2 is running; 3 is queued.
        let _ = k.block_switch(None);
        assert_eq!(k.current, Some(2));

        k.post_signals(1, sig);
        assert_eq!(
            k.ready_order(k.active_index()),
            vec![1, 3],
            "woken thread must be prepended, not appended"
        );

        // The wake cuts thread 2's quantum short at the next tick...
        assert!(k.preempt_tick());
        let _ = k.preempt_switch(FAKE_SP);
        // ...and the woken thread runs next.
        assert_eq!(k.current, Some(1));
        assert_eq!(k.threads[1].consume_wake(), sig);
    }

    #[test]
    fn wait_with_timeout_expires_into_sig_timeout() {
        let mut k = kernel_with_threads(2);
        let _sig = park_waiting(&mut k, 1, 100);
        let _ = k.block_switch(None);

        for _ in 0..99 {
            k.tick_1ms();
        }
        assert!(
            k.threads[1].active_signals().is_empty(),
            "must not fire early"
        );

        k.tick_1ms();
        assert_eq!(k.threads[1].active_signals(), SIG_TIMEOUT);
        assert_eq!(k.ready_order(k.active_index())[0], 1);
        assert_eq!(k.millis(), 100);

        // What the resumed wait would report.
        assert_eq!(k.threads[1].consume_wake(), SIG_TIMEOUT);
    }

    #[test]
    fn signal_beats_timeout_and_disarms_it() {
        let mut k = kernel_with_threads(2);
        let sig = park_waiting(&mut k, 1, 100);
        let _ = k.block_switch(None);

        for _ in 0..50 {
            k.tick_1ms();
        }
        k.post_signals(1, sig);

        assert_eq!(k.threads[1].links.home, ListId::ReadyA);
        assert_eq!(k.threads[1].timeout_offset, 0);
        assert!(k.timeout.head().is_none(), "timeout list must be empty");

        // Later ticks must not deliver a stale timeout.
        for _ in 0..100 {
            k.tick_1ms();
        }
        assert_eq!(k.threads[1].consume_wake(), sig);
        assert!(!k.threads[1].current_signals().intersects(SIG_TIMEOUT));
    }

    #[test]
    fn round_robin_shares_time_fairly() {
        let mut k = kernel_with_threads(4);
        let _ = k.block_switch(None); // dispatch the first thread

        let mut ran_ms = [0u32; 5];
        for _ in 0..600 {
            ran_ms[k.current.unwrap()] += 1;
            if k.preempt_tick() {
                let _ = k.preempt_switch(FAKE_SP);
            }
        }

        assert_eq!(ran_ms[0], 0, "idle thread must not run while others can");
        for slot in 1..=4 {
            let ms = ran_ms[slot];
            assert!(
                (150 - QUANTUM_TICKS as u32..=150 + QUANTUM_TICKS as u32)
                    .contains(&ms),
                "thread {slot} got {ms} ms of 600"
            );
        }
    }

    #[test]
    fn ready_lists_swap_when_the_active_one_drains() {
        let mut k = kernel_with_threads(2);
        let first_active = k.active_index();
        let _ = k.block_switch(None);
        assert_eq!(k.current, Some(1));

        // Run thread 1 and 2 through full quanta; both retire to the
        // expired list, which then becomes the active list.
        for _ in 0..QUANTUM_TICKS {
            assert_eq!(k.preempt_tick(), k.threads[1].quantum_remaining == 0);
        }
        let _ = k.preempt_switch(FAKE_SP);
        assert_eq!(k.current, Some(2));
        for _ in 0..QUANTUM_TICKS {
            let _ = k.preempt_tick();
        }
        let _ = k.preempt_switch(FAKE_SP);

        assert_eq!(k.current, Some(1));
        assert_ne!(k.active_index(), first_active);
    }

    #[test]
    fn idle_runs_only_when_nothing_else_can() {
        let mut k = kernel_with_threads(1);
        let sig = park_waiting(&mut k, 1, 0);

        // Only the idle thread is runnable.
        let _ = k.block_switch(None);
        assert_eq!(k.current, Some(0));

        // Idle is preempted but never queued.
        for _ in 0..QUANTUM_TICKS {
            let _ = k.preempt_tick();
        }
        let _ = k.preempt_switch(FAKE_SP);
        assert_eq!(k.current, Some(0));
        assert!(k.ready_order(0).is_empty());
        assert!(k.ready_order(1).is_empty());

        // A wake displaces idle at the next tick.
        k.post_signals(1, sig);
        assert!(k.preempt_tick());
        let _ = k.preempt_switch(FAKE_SP);
        assert_eq!(k.current, Some(1));
    }

    #[test]
    fn forbid_holds_off_preemption_until_permit() {
        let mut k = kernel_with_threads(2);
        let _ = k.block_switch(None);
        assert_eq!(k.current, Some(1));

        k.set_switching_enabled(false);
        for _ in 0..3 * QUANTUM_TICKS as usize {
            assert!(!k.preempt_tick(), "forbidden: must never switch");
        }
        assert_eq!(k.current, Some(1));

        k.set_switching_enabled(true);
        assert!(k.preempt_tick(), "quantum long since expired");
        let _ = k.preempt_switch(FAKE_SP);
        assert_eq!(k.current, Some(2));
    }

    #[test]
    fn wake_during_forbid_is_deferred_not_lost() {
        let mut k = kernel_with_threads(2);
        let sig = park_waiting(&mut k, 1, 0);
        let _ = k.block_switch(None);
        assert_eq!(k.current, Some(2));

        k.set_switching_enabled(false);
        k.post_signals(1, sig);
        assert!(!k.preempt_tick());
        assert_eq!(k.current, Some(2));

        k.set_switching_enabled(true);
        assert!(k.preempt_tick());
        let _ = k.preempt_switch(FAKE_SP);
        assert_eq!(k.current, Some(1));
    }

    #[test]
    fn signalling_the_current_thread_does_not_requeue_it() {
        let mut k = kernel_with_threads(1);
        let _ = k.block_switch(None);
        assert_eq!(k.current, Some(1));

        let sig = k.threads[1].allocate_signal(None).unwrap();
        assert!(k.threads[1].prepare_wait(sig, 0));
        k.post_signals(1, sig);

        assert_eq!(k.threads[1].links.home, ListId::None);
        // The wait returns immediately with the signal.
        assert_eq!(k.threads[1].consume_wake(), sig);
    }

    #[test]
    fn repeated_signals_coalesce_into_one_wake() {
        let mut k = kernel_with_threads(2);
        let sig = park_waiting(&mut k, 1, 0);
        let _ = k.block_switch(None);

        k.post_signals(1, sig);
        k.post_signals(1, sig);
        k.post_signals(1, sig);

        assert_eq!(k.ready_order(k.active_index()), vec![1]);
        assert_eq!(k.threads[1].consume_wake(), sig);
        // No residue: the coalesced raises were all consumed at once.
        assert!(k.threads[1].current_signals().is_empty());
    }

    #[test]
    fn stop_and_start_round_trip_through_the_reserved_bits() {
        let mut k = kernel_with_threads(2);
        let _sig = park_waiting(&mut k, 1, 0);
        let _ = k.block_switch(None);

        // The implicit stop bit is armed on every ordinary wait.
        assert!(k.threads[1].waiting_signals().intersects(SIG_STOP));
        k.post_signals(1, SIG_STOP);

        // The stopped-to-be thread gets dispatched and its wait resumes
        // with the stop bit.
        assert!(k.preempt_tick());
        let _ = k.preempt_switch(FAKE_SP);
        assert_eq!(k.current, Some(1));
        assert_eq!(k.threads[1].consume_wake(), SIG_STOP);

        // The hidden auto-stop: the wait recurses into a wait for
        // SIG_START and blocks again.
        assert!(k.threads[1].prepare_wait(SIG_START, 0));
        let _ = k.block_switch(Some(FAKE_SP));
        assert_eq!(k.threads[1].status(false), abi::ThreadStatus::Stopped);
        assert_eq!(k.current, Some(2));

        k.post_signals(1, SIG_START);
        assert_eq!(k.threads[1].consume_wake(), SIG_START);
    }

    fn test_heap() -> Heap {
        let region = Box::leak(
            vec![0u8; crate::config::HEAP_BYTES].into_boxed_slice(),
        );
        let mut heap = Heap::empty();
        // Safety: the leaked region lives forever and belongs to this heap
        // alone.
        unsafe { heap.init(region.as_mut_ptr()) };
        heap
    }

    #[test]
    fn created_threads_get_stacks_from_the_heap() {
        let mut k = Kernel::new();
        let mut heap = test_heap();
        let before = heap.free_bytes();

        let id = k
            .create_thread(
                &mut heap,
                "worker",
                200,
                Some(nop_entry),
                ThreadFlags::READY,
                None,
                core::ptr::null_mut(),
            )
            .unwrap();
        let index = id.index();
        // 200 bytes rounds up to 7 pages.
        assert_eq!(k.threads[index].stack_size(), 224);
        assert_eq!(heap.free_bytes(), before - 224);

        // Undersized requests are quietly raised to the minimum.
        let tiny = k
            .create_thread(
                &mut heap,
                "tiny",
                16,
                Some(nop_entry),
                ThreadFlags::READY,
                None,
                core::ptr::null_mut(),
            )
            .unwrap();
        assert_eq!(
            k.threads[tiny.index()].stack_size(),
            config::MIN_STACK_BYTES
        );

        // The fabricated context sits one frame below the stack top.
        let t = &k.threads[index];
        assert_eq!(
            t.saved_sp(),
            t.stack_base() + t.stack_size()
                - 1
                - crate::arch::INITIAL_FRAME_BYTES
        );

        assert_eq!(
            k.ready_order(k.active_index()),
            vec![index, tiny.index()]
        );
    }

    #[test]
    fn spawn_failures_are_reported_not_fatal() {
        let mut k = Kernel::new();
        let mut heap = test_heap();

        // Drain the heap, then ask for more.
        let _ = k
            .create_thread(
                &mut heap,
                "hog",
                crate::config::HEAP_BYTES - 256,
                Some(nop_entry),
                ThreadFlags::READY,
                None,
                core::ptr::null_mut(),
            )
            .unwrap();
        assert_eq!(
            k.create_thread(
                &mut heap,
                "late",
                512,
                Some(nop_entry),
                ThreadFlags::READY,
                None,
                core::ptr::null_mut(),
            ),
            Err(SpawnError::OutOfMemory)
        );
    }

    #[test]
    fn pool_exhaustion_and_recycling() {
        let mut k = Kernel::new();
        let mut heap = test_heap();

        let idle = k
            .create_thread(
                &mut heap,
                "idle",
                64,
                Some(nop_entry),
                ThreadFlags::empty(),
                None,
                core::ptr::null_mut(),
            )
            .unwrap();
        k.set_idle(idle.index());
        for _ in 0..2 {
            k.create_thread(
                &mut heap,
                "pool",
                256,
                None,
                ThreadFlags::POOL,
                None,
                core::ptr::null_mut(),
            )
            .unwrap();
        }

        let mut exit_code = 0i16;
        let job1 = k
            .pool_thread("job1", nop_entry, None, core::ptr::null_mut())
            .unwrap();
        let job2 = k
            .pool_thread("job2", nop_entry, None, &mut exit_code)
            .unwrap();
        assert!(
            k.pool_thread("job3", nop_entry, None, core::ptr::null_mut())
                .is_none(),
            "pool must be exhausted"
        );

        // job2 was prepended last, so it runs first, finishes its work,
        // and returns from its entry.
        let _ = k.block_switch(None);
        assert_eq!(k.current, Some(job2.index()));
        k.retire_current(&mut heap, 42);
        assert_eq!(exit_code, 42);
        assert_eq!(k.current, None);

        // The slot is back in the pool, stack and all, under a new
        // generation; the old incarnation is dead.
        let job3 = k
            .pool_thread("job3", nop_entry, None, core::ptr::null_mut())
            .expect("pool must refill after a pool thread terminates");
        assert_eq!(job3.index(), job2.index());
        assert_ne!(job3.generation(), job2.generation());
        assert_eq!(k.check_id(job2), None);
        let _ = job1;
    }

    #[test]
    fn stale_thread_ids_are_rejected() {
        let mut k = kernel_with_threads(1);
        let stale = current_id(&k.threads, 1);
        assert_eq!(k.check_id(stale), Some(1));

        // Reanimation bumps the generation; the old id goes dead.
        k.threads[1].links = crate::list::Links::DETACHED;
        k.ready[0] = List::new(ListId::ReadyA); // drop list state wholesale
        k.threads[1].reanimate(
            1,
            "reborn",
            || 0,
            ThreadFlags::READY,
            None,
            core::ptr::null_mut(),
        );
        assert_eq!(k.check_id(stale), None);
        let fresh = current_id(&k.threads, 1);
        assert_eq!(k.check_id(fresh), Some(1));

        // Empty slots and out-of-range indices are likewise dead.
        assert_eq!(k.check_id(current_id(&k.threads, 5)), None);
        assert_eq!(k.check_id(ThreadId(0x00ff)), None);
    }
}
