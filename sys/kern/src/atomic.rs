// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel atomic type support.
//!
//! AVR has no compare-and-swap, and rustc accordingly strips the
//! read-modify-write operations from `core::sync::atomic` there. This trait
//! describes the one atomic op the kernel needs beyond load/store, so that
//! each architecture can supply it natively or as an interrupt-masked
//! polyfill.
//!
//! Implementations of this trait are in the `arch::whatever` module for the
//! target architecture.

use core::sync::atomic::Ordering;

pub(crate) trait AtomicExt {
    type Primitive;
    fn swap_polyfill(
        &self,
        value: Self::Primitive,
        ordering: Ordering,
    ) -> Self::Primitive;
}
