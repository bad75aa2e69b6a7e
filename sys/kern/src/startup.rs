// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::ThreadFlags;
use unwrap_lite::UnwrapLite;

use crate::atomic::AtomicExt;
use crate::config::{self, KernelConfig};

/// Guards against the kernel being started twice. Set exactly once, by
/// [`start_kernel`].
static KERNEL_STARTED: AtomicBool = AtomicBool::new(false);

/// The main kernel entry point.
///
/// Brings up the allocator, builds the idle thread and the thread pool,
/// runs the application's `setup` function (this is where the first real
/// threads get created -- nothing can preempt it, since the scheduler is
/// not running yet), starts the tick timer, and dispatches the first
/// thread. The first context restore enables interrupts.
///
/// # Safety
///
/// Must be called from the reset path, on the boot stack, with interrupts
/// disabled, before anything else has touched kernel state. It may not be
/// called reentrantly, which is enforced, or after the scheduler has
/// started, which cannot be.
pub unsafe fn start_kernel(kconfig: KernelConfig, setup: fn()) -> ! {
    if KERNEL_STARTED.swap_polyfill(true, Ordering::AcqRel) {
        panic!(); // second call to start_kernel
    }

    let _ = crate::arch::disable_interrupts();

    // Safety: called once, before any allocation, interrupts masked.
    unsafe {
        crate::mem::init();
    }

    crate::mem::with_heap(|heap| {
        // Safety: interrupts are masked and nothing else is running yet.
        let k = unsafe { crate::sched::kernel_mut() };
        k.config = kconfig;

        // The idle thread is never on a ready list; the scheduler reaches
        // it by fallback when both ready lists are empty. Failure to build
        // it is fatal, so the unwraps here are deliberate.
        let idle = k
            .create_thread(
                heap,
                "idle",
                config::IDLE_STACK_BYTES,
                Some(kconfig.idle_entry),
                ThreadFlags::empty(),
                None,
                core::ptr::null_mut(),
            )
            .unwrap_lite();
        k.set_idle(idle.index());

        // Pool threads get a stack now and code later.
        for _ in 0..config::POOL_THREADS {
            k.create_thread(
                heap,
                "pool",
                config::POOL_STACK_BYTES,
                None,
                ThreadFlags::POOL,
                None,
                core::ptr::null_mut(),
            )
            .unwrap_lite();
        }
    });

    setup();

    crate::arch::init_tick_timer();

    // Go! This call selects the first ready thread (or idle) and restores
    // its fabricated context; it does not return to this stack.
    crate::arch::yield_switch();

    // Only the host stand-in arch can fall through the switch.
    unreachable!()
}
