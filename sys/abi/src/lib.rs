// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and applications.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Names a particular incarnation of a thread.
///
/// A `ThreadId` combines two fields, a thread index (the slot in the kernel's
/// thread table) and a generation number. The generation number begins
/// counting at zero and wraps on overflow. Critically, the generation number
/// of a thread is incremented every time the slot is reanimated -- whether
/// from the recycling pool or by fresh creation. Attempts to signal a thread
/// using an outdated generation are ignored. This is what makes a [`Synapse`]
/// a *weak* reference: holding one does not keep its target alive, and a
/// stale one cannot mis-signal whatever thread now occupies the slot.
///
/// The thread index is in the lower `ThreadId::INDEX_BITS` bits, while the
/// generation is in the remaining top bits.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct ThreadId(pub u16);

impl ThreadId {
    /// Number of bits in a `ThreadId` used to represent the thread index,
    /// rather than the generation number.
    pub const INDEX_BITS: u32 = 8;

    /// Derived mask of the index bits portion.
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    /// Fabricates a `ThreadId` for a known index and generation number.
    pub const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ThreadId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.0 as u16) << Self::INDEX_BITS,
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Type used to track generation numbers.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct Generation(u8);

impl Generation {
    pub const ZERO: Self = Self(0);

    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

impl From<u8> for Generation {
    fn from(x: u8) -> Self {
        Self(x)
    }
}

/// Width of the per-thread signal word, in bits.
pub const SIGNAL_BITS: u16 = 16;

/// Number of low signal bits reserved by the kernel on every thread.
pub const NUM_RESERVED_SIGNALS: u16 = 4;

/// Collection of signal bits belonging to one thread.
///
/// The low [`NUM_RESERVED_SIGNALS`] bits are owned by the kernel and are
/// pre-allocated on every thread; see the `SIG_*` constants. The rest are
/// available to applications through signal allocation.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(transparent)]
pub struct SignalSet(pub u16);

/// Raised by the kernel when a wait times out.
pub const SIG_TIMEOUT: SignalSet = SignalSet(1 << 0);
/// Raised to resume a stopped thread.
pub const SIG_START: SignalSet = SignalSet(1 << 1);
/// Raised to pause a thread at its next wait.
pub const SIG_STOP: SignalSet = SignalSet(1 << 2);
/// Conventional bit for termination synapses, so that a creator can wait for
/// a child to return from its entry function.
pub const SIG_TERMINATE: SignalSet = SignalSet(1 << 3);
/// All of the kernel-reserved bits together.
pub const SIG_ALL_RESERVED: SignalSet =
    SignalSet((1 << NUM_RESERVED_SIGNALS) - 1);

impl SignalSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Produces the one-hot set for bit `number`, which must be below
    /// [`SIGNAL_BITS`].
    pub const fn bit(number: u16) -> Self {
        Self(1 << number)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Checks whether any bit of `other` is also set in `self`.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Checks whether every bit of `other` is set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for SignalSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for SignalSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for SignalSet {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl core::ops::BitAndAssign for SignalSet {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl core::ops::Not for SignalSet {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0)
    }
}

/// Entry point for a thread. The return value is the thread's exit code.
pub type ThreadEntry = fn() -> i16;

bitflags::bitflags! {
    /// Collection of boolean flags controlling how a thread starts up and
    /// shuts down.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ThreadFlags: u8 {
        /// Thread is ready to run as soon as the scheduler allows.
        const READY = 1 << 0;
        /// Thread releases its control block and stack upon termination,
        /// rather than leaving them for someone else to reclaim.
        const SELF_DESTRUCT = 1 << 1;
        /// Thread is part of the recycling pool; termination returns it to
        /// the pool instead of destroying it.
        const POOL = 1 << 2;

        const RESERVED = !0b111;
    }
}

/// Externally visible scheduling state of a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadStatus {
    /// Currently executing on the CPU.
    Running,
    /// Runnable, queued on one of the ready lists.
    Ready,
    /// Blocked in a wait for signals.
    Waiting,
    /// Paused by `SIG_STOP`; resumes only on `SIG_START`.
    Stopped,
}

/// A signalable wake target: a thread paired with the signal bits to raise.
///
/// A `Synapse` is valid only while the thread incarnation it names exists;
/// the kernel checks the id's generation on every use and ignores stale
/// ones. It is therefore always safe to fire, from any context, including
/// interrupt handlers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Synapse {
    pub target: ThreadId,
    pub mask: SignalSet,
}

impl Synapse {
    pub const fn new(target: ThreadId, mask: SignalSet) -> Self {
        Self { target, mask }
    }
}
