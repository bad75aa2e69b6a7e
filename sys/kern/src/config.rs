// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static configuration of the kernel.
//!
//! The system takes a single shape specified at compile time: heap geometry,
//! quantum length, table sizes, and the pool dimensions all live here as
//! constants. The handful of behaviors an application may want to override at
//! runtime -- the idle loop, the stack overflow handler, the thread exit hook
//! -- are collected in [`KernelConfig`] and passed to
//! [`crate::startup::start_kernel`].

use abi::ThreadEntry;

use crate::thread::Thread;

/// Size of one heap page, in bytes. Small pages keep per-allocation waste
/// low on parts with only a few KiB of RAM.
pub const PAGE_BYTES: usize = 32;

/// Total bytes of RAM handed to the page allocator.
pub const HEAP_BYTES: usize = 4096;

/// Number of pages the allocator manages.
pub const HEAP_PAGES: u16 = (HEAP_BYTES / PAGE_BYTES) as u16;

/// Size of the allocator's bitmap, in bytes.
pub(crate) const HEAP_MAP_WORDS: usize = HEAP_BYTES / PAGE_BYTES / 8;

/// Number of slots in the thread table, including the idle thread and the
/// pool.
pub const MAX_THREADS: usize = 16;

/// Ticks a thread may run before being preempted onto the expired list.
pub const QUANTUM_TICKS: u8 = 15;

/// Number of recyclable threads created at startup.
pub const POOL_THREADS: usize = 2;

/// Stack size shared by every pool thread, in bytes.
pub const POOL_STACK_BYTES: usize = 256;

/// Smallest stack the kernel will fabricate. Requests below this are rounded
/// up; anything smaller cannot hold a saved context plus a useful call chain.
pub const MIN_STACK_BYTES: usize = 128;

/// Stack size of the idle thread.
pub const IDLE_STACK_BYTES: usize = MIN_STACK_BYTES;

const _: () = assert!(QUANTUM_TICKS >= 2, "QUANTUM_TICKS must be 2 or more");
const _: () = assert!(HEAP_BYTES % PAGE_BYTES == 0);
const _: () = assert!(HEAP_PAGES as usize % 8 == 0);
const _: () = assert!(
    MAX_THREADS <= abi::ThreadId::INDEX_MASK as usize + 1,
    "thread table exceeds the id index space"
);
const _: () = assert!(
    POOL_THREADS * POOL_STACK_BYTES < HEAP_BYTES,
    "thread pool consumes entire heap"
);
const _: () = assert!(POOL_STACK_BYTES >= MIN_STACK_BYTES);

/// Runtime hooks supplied by the application at kernel init.
///
/// Each has a conservative default, so an application that doesn't care can
/// pass `KernelConfig::default()`.
#[derive(Copy, Clone)]
pub struct KernelConfig {
    /// Entry function for the idle thread. Runs when there is nothing else
    /// to do, and only then. It must never block: do not call anything that
    /// directly or indirectly waits. Always be busy, or send the MCU to
    /// sleep.
    pub idle_entry: ThreadEntry,

    /// Called, on a known-good stack, when a thread is caught having
    /// overrun its stack. The damage is already done by the time this runs;
    /// the thread cannot be resumed meaningfully.
    pub on_stack_overflow: fn(&Thread),

    /// Called whenever any thread returns from its entry function, with the
    /// raw id of the departing thread and its exit code.
    pub on_thread_exit: fn(abi::ThreadId, i16),
}

impl KernelConfig {
    pub const DEFAULT: Self = Self {
        idle_entry: default_idle_entry,
        on_stack_overflow: default_stack_overflow,
        on_thread_exit: default_thread_exit,
    };
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

fn default_idle_entry() -> i16 {
    loop {
        crate::arch::wait_for_interrupt();
    }
}

fn default_stack_overflow(thread: &Thread) {
    crate::fail::die(thread.name());
}

fn default_thread_exit(_id: abi::ThreadId, _code: i16) {}
