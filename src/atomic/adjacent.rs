//! Double-wide CAS over two memory-adjacent halves.
//!
//! An [AdjacentWord] stores two halves side by side in a single word of twice their width, so
//! one CAS on that word updates both halves as a unit. Halves may be 1, 2 or 4 bytes wide.
//! 8 byte halves would need a 16 byte CAS, which is not assumed to exist, so `u64` does not
//! implement [Half] and an `AdjacentWord<u64>` is rejected at compile time.

use crate::atomic::{AtomicOps, Integer};
use core::fmt::{Debug, Formatter};

/// An unsigned integer which can be one half of an [AdjacentWord].
pub trait Half: Integer {
    /// An integer twice as wide as `Self`.
    type Double: Integer;

    /// The shared storage for a pair of halves. This is a native [crate::AtomicWord] when the
    /// target has an atomic of width `Double`. Otherwise it is the lock-based
    /// [crate::atomic::fallback::LockedWord].
    type Storage: AtomicOps<Value = Self::Double>;

    /// Lay out `first` at the lower address and `second` directly after it.
    fn join(first: Self, second: Self) -> Self::Double;

    /// The inverse of [Half::join].
    fn split(double: Self::Double) -> (Self, Self);
}

impl Half for u8 {
    type Double = u16;
    type Storage = crate::atomic::AtomicWord<u16>;

    #[inline]
    fn join(first: u8, second: u8) -> u16 {
        u16::from_ne_bytes([first, second])
    }

    #[inline]
    fn split(double: u16) -> (u8, u8) {
        let [first, second] = double.to_ne_bytes();
        (first, second)
    }
}

impl Half for u16 {
    type Double = u32;
    type Storage = crate::atomic::AtomicWord<u32>;

    #[inline]
    fn join(first: u16, second: u16) -> u32 {
        let [a, b] = first.to_ne_bytes();
        let [c, d] = second.to_ne_bytes();
        u32::from_ne_bytes([a, b, c, d])
    }

    #[inline]
    fn split(double: u32) -> (u16, u16) {
        let [a, b, c, d] = double.to_ne_bytes();
        (u16::from_ne_bytes([a, b]), u16::from_ne_bytes([c, d]))
    }
}

#[cfg(any(target_has_atomic = "64", feature = "std"))]
impl Half for u32 {
    type Double = u64;

    #[cfg(target_has_atomic = "64")]
    type Storage = crate::atomic::AtomicWord<u64>;
    #[cfg(not(target_has_atomic = "64"))]
    type Storage = crate::atomic::fallback::LockedWord<u64>;

    #[inline]
    fn join(first: u32, second: u32) -> u64 {
        let [a, b, c, d] = first.to_ne_bytes();
        let [e, f, g, h] = second.to_ne_bytes();
        u64::from_ne_bytes([a, b, c, d, e, f, g, h])
    }

    #[inline]
    fn split(double: u64) -> (u32, u32) {
        let [a, b, c, d, e, f, g, h] = double.to_ne_bytes();
        (u32::from_ne_bytes([a, b, c, d]), u32::from_ne_bytes([e, f, g, h]))
    }
}

/// Two adjacent halves which are only ever read and written together.
pub struct AdjacentWord<H: Half> {
    storage: H::Storage,
}

impl<H: Half> AdjacentWord<H> {
    pub fn new(first: H, second: H) -> Self {
        Self {
            storage: H::Storage::new(H::join(first, second)),
        }
    }

    #[inline]
    pub fn load_pair(&self) -> (H, H) {
        H::split(self.storage.load())
    }

    #[inline]
    pub fn store_pair(&self, first: H, second: H) {
        self.storage.store(H::join(first, second))
    }

    /// Replace both halves iff both currently match, returning the previous pair on success
    /// and the observed pair on failure.
    #[inline]
    pub fn compare_exchange_pair(&self, expected: (H, H), new: (H, H)) -> Result<(H, H), (H, H)> {
        self.storage
            .compare_exchange(H::join(expected.0, expected.1), H::join(new.0, new.1))
            .map(H::split)
            .map_err(H::split)
    }

    /// Replace `(first, second)` with `(new_first, new_second)` iff both halves currently hold
    /// the expected values.
    #[inline]
    pub fn adjacent_compare_and_swap(
        &self,
        expected_first: H,
        expected_second: H,
        new_first: H,
        new_second: H,
    ) -> bool {
        self.storage.compare_and_swap(
            H::join(expected_first, expected_second),
            H::join(new_first, new_second),
        )
    }
}

impl<H: Half> Debug for AdjacentWord<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let (first, second): (H, H) = self.load_pair();
        f.debug_tuple("AdjacentWord").field(&first).field(&second).finish()
    }
}
