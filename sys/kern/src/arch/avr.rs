// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AVR (ATmega328P-class) architecture support.
//!
//! # Context layout
//!
//! A suspended thread's context lives entirely on its own stack, in a fixed
//! 35-byte frame; only the stack pointer itself is held in the thread's
//! control block. From the highest address down, the frame is:
//!
//! - the 2-byte return address (pushed by `call` on the voluntary path, or
//!   by interrupt entry on the preemptive path),
//! - `r0`, `SREG`, `r1`, `r18`..`r31` (the "initial" set: everything the
//!   calling convention lets a called function clobber, plus the flags),
//! - `r2`..`r17` (the "extended" set: the callee-saved registers).
//!
//! The split matters: the preemption interrupt saves only the initial set
//! first, which is enough to call into the scheduler and ask whether a
//! switch is due at all. Most ticks the answer is no, the initial set is
//! popped, and we're out -- the extended registers never move.
//!
//! # Timer use
//!
//! One 8-bit timer in CTC mode provides both kernel interrupts: compare
//! unit A is the millisecond/timeout tick, compare unit B is the
//! preemption tick. They fire at the same 1 kHz rate and, sharing a
//! vector priority order, never race each other.
//!
//! # Fabricated frames
//!
//! A new thread's stack is written to look exactly like the frame above,
//! with all registers zero, the return address aimed at the thread
//! trampoline, and the trampoline's two arguments (thread table index,
//! entry function) pre-loaded into the slots for `r24`:`r25` and
//! `r22`:`r23`, per the GCC calling convention.

use core::arch::{asm, naked_asm};
use core::sync::atomic::Ordering;

use abi::ThreadEntry;

use crate::atomic::AtomicExt;

/// Bytes of a full saved context: 2 return-address bytes, 32 registers,
/// and SREG.
pub const INITIAL_FRAME_BYTES: usize = 35;

/// Top of SRAM; the safe-stack region for the overflow handler.
const RAMEND: usize = 0x08ff;

/// CPU clock. The tick timer below is scaled for this.
const F_CPU_HZ: u32 = 16_000_000;

// Frame offsets (from the stack *top*, i.e. the highest written byte) of
// the argument-register slots the fabricated frame must fill.
const FRAME_R22: usize = 9;
const FRAME_R23: usize = 10;
const FRAME_R24: usize = 11;
const FRAME_R25: usize = 12;

/// Prepares a thread's stack so that the first context restore "returns"
/// into the trampoline with `(index, entry)` in the argument registers.
/// Returns the fabricated stack pointer value.
pub fn fabricate_stack(
    stack_base: usize,
    stack_size: usize,
    index: u16,
    entry: ThreadEntry,
) -> usize {
    let top = stack_base + stack_size - 1;
    let trampoline = crate::sched::thread_entry_trampoline as usize as u16;
    let entry = entry as usize as u16;

    // Safety: the caller owns `stack_base..stack_base + stack_size` and the
    // thread it belongs to is not running.
    unsafe {
        let slot = |offset: usize| (top - offset) as *mut u8;

        // Return address, low byte pushed last (higher address).
        slot(0).write(trampoline as u8);
        slot(1).write((trampoline >> 8) as u8);

        // Registers and SREG all start zero. SREG zero means interrupts
        // stay masked through the restore; the closing `reti` is what
        // turns them on.
        for offset in 2..INITIAL_FRAME_BYTES {
            slot(offset).write(0);
        }

        slot(FRAME_R24).write(index as u8);
        slot(FRAME_R25).write((index >> 8) as u8);
        slot(FRAME_R22).write(entry as u8);
        slot(FRAME_R23).write((entry >> 8) as u8);
    }

    // AVR SP points at the first free byte below the frame.
    top - INITIAL_FRAME_BYTES
}

/// Masks interrupts, returning the previous SREG for
/// [`restore_interrupts`].
pub fn disable_interrupts() -> u8 {
    let sreg: u8;
    // Safety: reading SREG and clearing I has no memory effects.
    unsafe {
        asm!(
            "in {sreg}, 0x3f",
            "cli",
            sreg = out(reg) sreg,
            options(nomem, nostack, preserves_flags)
        );
    }
    sreg
}

/// Restores a SREG previously captured by [`disable_interrupts`].
pub fn restore_interrupts(sreg: u8) {
    // Safety: restoring a previously captured SREG.
    unsafe {
        asm!(
            "out 0x3f, {sreg}",
            sreg = in(reg) sreg,
            options(nomem, nostack)
        );
    }
}

/// Runs `body` with interrupts masked, restoring the previous state after.
/// Nests freely.
pub fn atomic<R>(body: impl FnOnce() -> R) -> R {
    let sreg = disable_interrupts();
    let result = body();
    restore_interrupts(sreg);
    result
}

/// Voluntarily hands the CPU to another thread.
///
/// Saves the full context onto the current stack (the `call` that got us
/// here already pushed the resume address), lets the scheduler pick a
/// successor, and restores that thread's context. Execution resumes here
/// -- with interrupts enabled by the closing `reti` -- when this thread is
/// next dispatched.
///
/// Interrupts must already be masked by the caller.
#[unsafe(naked)]
pub extern "C" fn yield_switch() {
    naked_asm!(
        // Initial set.
        "push r0",
        "in r0, 0x3f",
        "push r0",
        "push r1",
        "push r18",
        "push r19",
        "push r20",
        "push r21",
        "push r22",
        "push r23",
        "push r24",
        "push r25",
        "push r26",
        "push r27",
        "push r28",
        "push r29",
        "push r30",
        "push r31",
        // Extended set.
        "push r2",
        "push r3",
        "push r4",
        "push r5",
        "push r6",
        "push r7",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push r16",
        "push r17",
        // The compiler-side calling convention needs the zero register.
        "clr r1",
        // Hand the saved stack pointer to the scheduler; it returns the
        // successor's.
        "in r24, 0x3d",
        "in r25, 0x3e",
        "call {switch}",
        "out 0x3d, r24",
        "out 0x3e, r25",
        // Unwind the successor's frame, mirror-image.
        "pop r17",
        "pop r16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop r7",
        "pop r6",
        "pop r5",
        "pop r4",
        "pop r3",
        "pop r2",
        "pop r31",
        "pop r30",
        "pop r29",
        "pop r28",
        "pop r27",
        "pop r26",
        "pop r25",
        "pop r24",
        "pop r23",
        "pop r22",
        "pop r21",
        "pop r20",
        "pop r19",
        "pop r18",
        "pop r1",
        "pop r0",
        "out 0x3f, r0",
        "pop r0",
        "reti",
        switch = sym crate::sched::isr_block_switch,
    )
}

/// Millisecond timer and timeout controller (timer 0, compare unit A).
#[unsafe(naked)]
#[unsafe(export_name = "__vector_14")]
pub extern "C" fn timer0_compa() {
    naked_asm!(
        "push r0",
        "in r0, 0x3f",
        "push r0",
        "push r1",
        "push r18",
        "push r19",
        "push r20",
        "push r21",
        "push r22",
        "push r23",
        "push r24",
        "push r25",
        "push r26",
        "push r27",
        "push r28",
        "push r29",
        "push r30",
        "push r31",
        "clr r1",
        "call {tick}",
        "pop r31",
        "pop r30",
        "pop r29",
        "pop r28",
        "pop r27",
        "pop r26",
        "pop r25",
        "pop r24",
        "pop r23",
        "pop r22",
        "pop r21",
        "pop r20",
        "pop r19",
        "pop r18",
        "pop r1",
        "pop r0",
        "out 0x3f, r0",
        "pop r0",
        "reti",
        tick = sym crate::sched::isr_millisecond_tick,
    )
}

/// Preemptive context switch (timer 0, compare unit B).
///
/// Saves the initial register set, asks the scheduler whether the quantum
/// is up; if not (or switching is forbidden) restores and leaves without
/// the extended registers ever moving.
#[unsafe(naked)]
#[unsafe(export_name = "__vector_15")]
pub extern "C" fn timer0_compb() {
    naked_asm!(
        // Save registers enough to do basic checking.
        "push r0",
        "in r0, 0x3f",
        "push r0",
        "push r1",
        "push r18",
        "push r19",
        "push r20",
        "push r21",
        "push r22",
        "push r23",
        "push r24",
        "push r25",
        "push r26",
        "push r27",
        "push r28",
        "push r29",
        "push r30",
        "push r31",
        "clr r1",
        "call {should}",
        "and r24, r24",
        "brne 2f",
        // No switch due: restore the initial set and bail.
        "pop r31",
        "pop r30",
        "pop r29",
        "pop r28",
        "pop r27",
        "pop r26",
        "pop r25",
        "pop r24",
        "pop r23",
        "pop r22",
        "pop r21",
        "pop r20",
        "pop r19",
        "pop r18",
        "pop r1",
        "pop r0",
        "out 0x3f, r0",
        "pop r0",
        "reti",
        // We're switching, so save the rest.
        "2:",
        "push r2",
        "push r3",
        "push r4",
        "push r5",
        "push r6",
        "push r7",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push r16",
        "push r17",
        "in r24, 0x3d",
        "in r25, 0x3e",
        "call {switch}",
        "out 0x3d, r24",
        "out 0x3e, r25",
        // Bring the successor online.
        "pop r17",
        "pop r16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop r7",
        "pop r6",
        "pop r5",
        "pop r4",
        "pop r3",
        "pop r2",
        "pop r31",
        "pop r30",
        "pop r29",
        "pop r28",
        "pop r27",
        "pop r26",
        "pop r25",
        "pop r24",
        "pop r23",
        "pop r22",
        "pop r21",
        "pop r20",
        "pop r19",
        "pop r18",
        "pop r1",
        "pop r0",
        "out 0x3f, r0",
        "pop r0",
        "reti",
        should = sym crate::sched::isr_preempt_should_switch,
        switch = sym crate::sched::isr_preempt_switch,
    )
}

/// Runs `body` on a known-good stack at the top of RAM.
///
/// Used for the overflow handler: the overflowed thread's stack cannot be
/// trusted to hold even one more call frame. Locals of the *calling* frame
/// remain addressable through the frame pointer; only pushes move to the
/// safe region.
pub fn with_safe_stack(body: impl FnOnce()) {
    let saved = current_sp();
    // Safety: interrupts are masked on every path that reaches here, so
    // nothing else can touch either stack while we're borrowing the top of
    // RAM.
    unsafe {
        set_sp(RAMEND);
    }
    body();
    // Safety: restoring the exact value captured above.
    unsafe {
        set_sp(saved);
    }
}

fn current_sp() -> usize {
    let lo: u8;
    let hi: u8;
    // Safety: reading SPL/SPH has no side effects.
    unsafe {
        asm!(
            "in {lo}, 0x3d",
            "in {hi}, 0x3e",
            lo = out(reg) lo,
            hi = out(reg) hi,
            options(nomem, nostack, preserves_flags)
        );
    }
    usize::from(lo) | usize::from(hi) << 8
}

/// # Safety
///
/// Interrupts must be masked, and `sp` must point into memory that can
/// absorb subsequent pushes.
unsafe fn set_sp(sp: usize) {
    // Safety: per the function's contract.
    unsafe {
        asm!(
            "out 0x3d, {lo}",
            "out 0x3e, {hi}",
            lo = in(reg) sp as u8,
            hi = in(reg) (sp >> 8) as u8,
            options(nomem, nostack)
        );
    }
}

/// Idles the CPU until the next interrupt. This is what the default idle
/// thread does, forever.
pub fn wait_for_interrupt() {
    const SMCR: *mut u8 = 0x53 as *mut u8;
    // Safety: SMCR writes select the sleep mode; idle mode wakes on any
    // interrupt, including our own tick.
    unsafe {
        SMCR.write_volatile(0b0000_0001); // SE, mode = idle
        asm!("sleep", options(nomem, nostack));
        SMCR.write_volatile(0);
    }
}

/// Starts the kernel heartbeat: timer 0 in CTC mode, both compare units at
/// 1 kHz. Global interrupts are not enabled here.
pub fn init_tick_timer() {
    const TCCR0A: *mut u8 = 0x44 as *mut u8;
    const TCCR0B: *mut u8 = 0x45 as *mut u8;
    const TCNT0: *mut u8 = 0x46 as *mut u8;
    const OCR0A: *mut u8 = 0x47 as *mut u8;
    const OCR0B: *mut u8 = 0x48 as *mut u8;
    const TIMSK0: *mut u8 = 0x6e as *mut u8;

    // 1 ms at /64 prescale.
    const TOP: u8 = (F_CPU_HZ / 64 / 1000 - 1) as u8;

    // Safety: whole-register writes to a peripheral the kernel owns
    // outright (applications must not touch timer 0).
    unsafe {
        TCCR0B.write_volatile(0); // stop the clock
        TCNT0.write_volatile(0);
        OCR0A.write_volatile(TOP);
        OCR0B.write_volatile(TOP);
        TCCR0A.write_volatile(0b0000_0010); // CTC on OCR0A
        TIMSK0.write_volatile(0b0000_0110); // OCIE0A | OCIE0B
        TCCR0B.write_volatile(0b0000_0011); // /64, go
    }
}

/// Hard reset, by jumping through the reset vector. Peripheral state is
/// *not* reset; use the watchdog if that matters to you.
pub fn reset() -> ! {
    // Safety: noreturn jump to the reset vector.
    unsafe {
        asm!("cli", "jmp 0", options(noreturn));
    }
}

impl AtomicExt for core::sync::atomic::AtomicBool {
    type Primitive = bool;
    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        _ordering: Ordering,
    ) -> Self::Primitive {
        // No CAS on AVR; masking interrupts makes load+store one step.
        atomic(|| {
            let previous = self.load(Ordering::Relaxed);
            self.store(value, Ordering::Relaxed);
            previous
        })
    }
}
