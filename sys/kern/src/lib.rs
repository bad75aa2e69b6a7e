// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! zero kernel.
//!
//! This is a preemptive multitasking kernel for single-core 8-bit
//! microcontrollers: a round-robin scheduler over a fixed thread table, a
//! signal-bit wait/wake primitive as the only way to block, and a
//! page-granular allocator feeding both thread stacks and application
//! data. Everything outside the `arch` module is *intended* to be portable;
//! it is developed and tested against the host stand-in arch and run in
//! anger on AVR, so some AVR-isms may have leaked into the portable parts.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic
//! ideas that appear consistently.
//!
//! 1. Static shape. The thread table, heap geometry, and quantum are fixed
//!    at compile time; the only dynamic resource is heap pages.
//! 2. One way to block. Every synchronization construct -- sleeps,
//!    timeouts, stop/start, driver completion -- reduces to signal bits
//!    and `wait`. There is no second mechanism to get wrong.
//! 3. Interrupt masking is the mutex. On one core, exclusive access to
//!    kernel state is a masked section, composed with the cheaper
//!    `forbid`/`permit` for holding off preemption alone.
//! 4. A strong preference for safe code where reasonable, and for simple
//!    and clear algorithms over fast and clever ones.

// Allow std-y things to be used in test. Note that this attribute is a bit
// of a trap for the programmer, because rust-analyzer by default seems to
// build things with test set. This means it's easy to introduce code
// incompatible with no_std without your editor hassling you about it.
// Beware.
#![cfg_attr(not(test), no_std)]

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

pub mod arch;
pub(crate) mod atomic;
pub mod config;
pub mod err;
pub mod fail;
pub(crate) mod list;
pub mod mem;
pub mod profiling;
pub(crate) mod sched;
pub mod startup;
pub mod syscalls;
pub mod thread;
pub mod time;
