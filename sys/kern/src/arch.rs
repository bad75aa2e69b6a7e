// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names: the initial frame geometry, stack fabrication, interrupt
//! mask control, the voluntary switch, the safe-stack trampoline, and the
//! tick timer.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "avr")] {
        pub mod avr;
        pub use avr::*;
    } else {
        // Anything else gets the host stand-in, which supports developing
        // and testing the portable parts of the kernel but cannot actually
        // run threads.
        pub mod host;
        pub use host::*;
    }
}
