// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel crashes/failures such that they can be
//! found by tooling.
//!
//! This module defines the following binary interface to debuggers:
//!
//! - `kern::fail::KERNEL_HAS_FAILED` is a `bool`. It is cleared to zero
//!   (false) at load time, and set to one (true) if the kernel reaches the
//!   `die` function (either explicitly or as a result of a `panic!`). If it
//!   contains any other value, the kernel has either not yet booted, or has
//!   corrupted memory on the way down.
//!
//! - `kern::fail::KERNEL_EPITAPH` is an array of `u8`. The `die` routine
//!   writes as much of the failure reason into this buffer (as UTF-8) as
//!   possible, truncating if the buffer fills. The number of bytes written
//!   isn't recorded anywhere; instead, for printing, trim off any trailing
//!   NUL bytes.

use core::fmt::{Display, Write};
use core::sync::atomic::Ordering;

/// Flag that gets set to `true` by all failure reporting functions, giving
/// tools a one-stop-shop for doing kernel triage.
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

const EPITAPH_LEN: usize = 64;

/// The "epitaph" buffer records up to `EPITAPH_LEN` bytes of description of
/// the event that caused the kernel to fail, padded with NULs.
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // AVR has no atomic swap, and by the time we're dying there is nothing
    // to win a race against anyway: this path runs with interrupts masked
    // or on the way down from a panic.
    //
    // Safety: we only access this flag from this one site, and never from a
    // context where concurrency is enabled.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Welp, you've called begin_epitaph twice, suggesting a recursive
        // panic. We can't very well panic in response to this since it'll
        // just make the problem worse.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: we can get a mutable reference to the epitaph because only
    // one execution of this function will get past the flag above.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Records `msg` as the kernel's last words and halts.
#[inline(always)]
pub fn die(msg: impl Display) -> ! {
    die_impl(&msg)
}

#[inline(never)]
fn die_impl(msg: &dyn Display) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

struct Eulogist {
    dest: &'static mut [u8],
}

impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(all(target_arch = "avr", not(test)))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    die(info)
}
