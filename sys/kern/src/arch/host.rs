// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host stand-in for the architecture layer.
//!
//! This exists so the portable parts of the kernel -- the scheduler, the
//! signal machinery, the allocator -- can be compiled and tested on a
//! development machine. It models the *arithmetic* of the real port
//! faithfully (frame sizes, fabricated stack pointers) but performs no
//! machine-state changes: interrupts don't exist, and a "context switch"
//! only runs the scheduler's bookkeeping before control returns to the
//! caller as if it had been resumed immediately.

use core::sync::atomic::Ordering;

use abi::ThreadEntry;

use crate::atomic::AtomicExt;

/// Matches the AVR port's frame: a 2-byte return address plus 32 registers
/// and SREG, so stack accounting comes out the same on both.
pub const INITIAL_FRAME_BYTES: usize = 35;

/// Computes where the stack pointer would sit after fabrication. Nothing is
/// written; the host cannot enter threads, and tests are free to use
/// addresses that don't exist.
///
/// Mirrors the AVR arithmetic: the frame hangs off the last byte of the
/// stack, and SP points at the first free byte below it.
pub fn fabricate_stack(
    stack_base: usize,
    stack_size: usize,
    _index: u16,
    _entry: ThreadEntry,
) -> usize {
    stack_base + stack_size - 1 - INITIAL_FRAME_BYTES
}

pub fn disable_interrupts() -> u8 {
    0
}

pub fn restore_interrupts(_token: u8) {}

/// Runs `body` "atomically." There is nothing to mask on the host, where
/// tests are single-threaded by construction.
pub fn atomic<R>(body: impl FnOnce() -> R) -> R {
    body()
}

/// Performs the scheduler bookkeeping of a voluntary switch and returns.
/// The caller continues executing as though it had blocked and been woken.
pub fn yield_switch() {
    // Safety: single-threaded host; nothing else can be holding the
    // kernel.
    let k = unsafe { crate::sched::kernel_mut() };
    let _ = k.block_switch(None);
}

pub fn with_safe_stack(body: impl FnOnce()) {
    body()
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn init_tick_timer() {}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}

impl AtomicExt for core::sync::atomic::AtomicBool {
    type Primitive = bool;
    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive {
        self.swap(value, ordering)
    }
}
