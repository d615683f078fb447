//! Per-object epoch tag bits.
//!
//! Every metadata object carries a [`TagCell`]: one byte of "used" marks
//! split into two generations. Event recording marks objects in the
//! current generation while a checkpoint pass reads the other one, so
//! producers never contend with the serializer (see the epoch split in the
//! concurrency model). The cell is attached to host-owned objects; the
//! engine only reads, sets, and clears it through this interface.

use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// One of the two tag-bit generations.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EpochId(bool);

impl EpochId {
    /// The other generation.
    #[inline]
    pub const fn other(self) -> EpochId {
        EpochId(!self.0)
    }

    #[inline]
    const fn odd(self) -> bool {
        self.0
    }
}

/// The engine's epoch phase.
///
/// Flipped by the external scheduler between passes; marks made by
/// producers always land in `this_epoch`, and a steady-state pass only
/// reads `prev_epoch`, so marks made during an in-progress pass become
/// visible in the next one.
pub struct Epoch {
    phase: AtomicBool,
}

impl Epoch {
    pub const fn new() -> Self {
        Epoch {
            phase: AtomicBool::new(false),
        }
    }

    /// Generation that new marks target.
    #[inline]
    pub fn this_epoch(&self) -> EpochId {
        EpochId(self.phase.load(Ordering::Relaxed))
    }

    /// Generation a steady-state pass consumes.
    #[inline]
    pub fn prev_epoch(&self) -> EpochId {
        self.this_epoch().other()
    }

    /// Advance to the next generation. Must not be called while a
    /// checkpoint pass is in progress.
    pub fn flip(&self) {
        self.phase.fetch_xor(true, Ordering::Relaxed);
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Per-object tag bits, two generations of four marks each.
    ///
    /// `USED` admits the object into a checkpoint; `LEAK` admits it into
    /// the narrower leak-subset stream; the `MEMBERS_*` pair lives on
    /// types only and records that some member of the type carries the
    /// corresponding mark. Member cells use only the `USED` pair.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct TagBits: u8 {
        const USED_GEN0         = 1 << 0;
        const USED_GEN1         = 1 << 1;
        const LEAK_GEN0         = 1 << 2;
        const LEAK_GEN1         = 1 << 3;
        const MEMBERS_USED_GEN0 = 1 << 4;
        const MEMBERS_USED_GEN1 = 1 << 5;
        const MEMBERS_LEAK_GEN0 = 1 << 6;
        const MEMBERS_LEAK_GEN1 = 1 << 7;
    }
}

impl TagBits {
    /// The used bit for a generation.
    #[inline]
    pub const fn used(epoch: EpochId) -> TagBits {
        if epoch.odd() {
            TagBits::USED_GEN1
        } else {
            TagBits::USED_GEN0
        }
    }

    /// The leak-subset bit for a generation.
    #[inline]
    pub const fn leak(epoch: EpochId) -> TagBits {
        if epoch.odd() {
            TagBits::LEAK_GEN1
        } else {
            TagBits::LEAK_GEN0
        }
    }

    /// The members-used bit for a generation (types only).
    #[inline]
    pub const fn members_used(epoch: EpochId) -> TagBits {
        if epoch.odd() {
            TagBits::MEMBERS_USED_GEN1
        } else {
            TagBits::MEMBERS_USED_GEN0
        }
    }

    /// The members-leak bit for a generation (types only).
    #[inline]
    pub const fn members_leak(epoch: EpochId) -> TagBits {
        if epoch.odd() {
            TagBits::MEMBERS_LEAK_GEN1
        } else {
            TagBits::MEMBERS_LEAK_GEN0
        }
    }

    /// All four bits of one generation; what a pass clears when done.
    #[inline]
    pub const fn generation(epoch: EpochId) -> TagBits {
        TagBits::used(epoch)
            .union(TagBits::leak(epoch))
            .union(TagBits::members_used(epoch))
            .union(TagBits::members_leak(epoch))
    }
}

/// Tag-bit storage attached to a metadata object.
///
/// Relaxed atomics throughout: the generation split is what isolates
/// producers from an in-progress pass, not memory ordering.
pub struct TagCell(AtomicU8);

impl TagCell {
    pub const fn new() -> Self {
        TagCell(AtomicU8::new(0))
    }

    /// Set the given bits.
    #[inline]
    pub fn set(&self, bits: TagBits) {
        self.0.fetch_or(bits.bits(), Ordering::Relaxed);
    }

    /// True if any of the given bits is set.
    #[inline]
    pub fn test_any(&self, bits: TagBits) -> bool {
        self.0.load(Ordering::Relaxed) & bits.bits() != 0
    }

    /// Clear the given bits, leaving the rest untouched.
    #[inline]
    pub fn clear(&self, bits: TagBits) {
        self.0.fetch_and(!bits.bits(), Ordering::Relaxed);
    }

    /// Snapshot of the current bits.
    pub fn load(&self) -> TagBits {
        TagBits::from_bits_truncate(self.0.load(Ordering::Relaxed))
    }
}

impl Default for TagCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TagCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TagCell({:?})", self.load())
    }
}
