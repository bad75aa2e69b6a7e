// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Kernel errors are deliberately boring: everything recoverable is reported
//! through `Result`/`Option` return values, and nothing in this module can
//! allocate or panic. The only fatal condition the kernel recognizes is a
//! stack overflow, which is routed through `fail`, not here.

/// The page allocator could not satisfy a request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OutOfMemory;

/// A thread could not be created.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpawnError {
    /// No stack memory was available.
    OutOfMemory,
    /// Every slot in the thread table is occupied.
    NoThreadSlot,
}

impl From<OutOfMemory> for SpawnError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}
