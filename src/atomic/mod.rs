//! Portable compare-and-swap, increment and decrement over 1, 2, 4 and 8 byte words.
//!
//! Every operation goes through the [AtomicOps] trait. [AtomicWord] is the native
//! implementation, and which widths it supports is decided at compile time from
//! `target_has_atomic`. [fallback::LockedWord] implements the same trait on top of one
//! process-wide lock, for words the target cannot update atomically.
//!
//! Orderings are fixed rather than chosen per call site. A successful CAS or read-modify-write
//! is `AcqRel`. A failed CAS and a load are `Acquire`. A store is `Release`.

use crate::sync::Ordering;
use core::fmt::{Debug, Formatter};

pub mod adjacent;
#[cfg(feature = "std")]
pub mod fallback;

pub use adjacent::{AdjacentWord, Half};

mod private {
    pub trait Sealed {}
}

/// A plain fixed-width integer which can be the value of an atomic location.
pub trait Integer: Copy + Eq + Debug + Send + Sync + 'static + private::Sealed {
    /// The width of this integer in bytes.
    const BYTES: usize;

    fn wrapping_increment(self) -> Self;
    fn wrapping_decrement(self) -> Self;
}

/// An [Integer] the target can update with a native atomic instruction.
pub trait Word: Integer {
    /// The atomic type backing an [AtomicWord] of this width.
    type Atomic: Send + Sync;

    fn new_atomic(value: Self) -> Self::Atomic;
    fn atomic_load(atomic: &Self::Atomic) -> Self;
    fn atomic_store(atomic: &Self::Atomic, value: Self);
    fn atomic_compare_exchange(atomic: &Self::Atomic, expected: Self, new: Self) -> Result<Self, Self>;
    /// Add one and return the new value.
    fn atomic_increment(atomic: &Self::Atomic) -> Self;
    /// Subtract one and return the new value.
    fn atomic_decrement(atomic: &Self::Atomic) -> Self;
}

/// The operations available on a shared word.
///
/// Once a location is shared between threads, it must only be read or written through these
/// operations. None of them can fail other than by reporting that a CAS did not match.
pub trait AtomicOps: Send + Sync {
    type Value: Copy + Eq + Debug;

    fn new(value: Self::Value) -> Self
    where
        Self: Sized;

    fn load(&self) -> Self::Value;

    fn store(&self, value: Self::Value);

    /// Replace the value with `new` iff it is currently `expected`.
    ///
    /// Returns the previous value on success and the observed value on failure. This is a
    /// strong CAS: it never fails while the value equals `expected`.
    fn compare_exchange(&self, expected: Self::Value, new: Self::Value) -> Result<Self::Value, Self::Value>;

    /// Like [AtomicOps::compare_exchange], reporting only whether the swap happened.
    fn compare_and_swap(&self, expected: Self::Value, new: Self::Value) -> bool {
        self.compare_exchange(expected, new).is_ok()
    }

    /// Atomically add one, wrapping on overflow, and return the new value.
    fn increment(&self) -> Self::Value;

    /// Atomically subtract one, wrapping on underflow, and return the new value.
    fn decrement(&self) -> Self::Value;
}

macro_rules! impl_word {
    ($cfg:literal, $int:ty, $atomic:ident) => {
        impl private::Sealed for $int {}

        impl Integer for $int {
            const BYTES: usize = core::mem::size_of::<$int>();

            #[inline]
            fn wrapping_increment(self) -> Self {
                self.wrapping_add(1)
            }

            #[inline]
            fn wrapping_decrement(self) -> Self {
                self.wrapping_sub(1)
            }
        }

        #[cfg(target_has_atomic = $cfg)]
        impl Word for $int {
            type Atomic = crate::sync::$atomic;

            #[inline]
            fn new_atomic(value: Self) -> Self::Atomic {
                crate::sync::$atomic::new(value)
            }

            #[inline]
            fn atomic_load(atomic: &Self::Atomic) -> Self {
                atomic.load(Ordering::Acquire)
            }

            #[inline]
            fn atomic_store(atomic: &Self::Atomic, value: Self) {
                atomic.store(value, Ordering::Release)
            }

            #[inline]
            fn atomic_compare_exchange(atomic: &Self::Atomic, expected: Self, new: Self) -> Result<Self, Self> {
                atomic.compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            }

            #[inline]
            fn atomic_increment(atomic: &Self::Atomic) -> Self {
                atomic.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
            }

            #[inline]
            fn atomic_decrement(atomic: &Self::Atomic) -> Self {
                atomic.fetch_sub(1, Ordering::AcqRel).wrapping_sub(1)
            }
        }
    };
}

impl_word!("8", u8, AtomicU8);
impl_word!("8", i8, AtomicI8);
impl_word!("16", u16, AtomicU16);
impl_word!("16", i16, AtomicI16);
impl_word!("32", u32, AtomicU32);
impl_word!("32", i32, AtomicI32);
impl_word!("64", u64, AtomicU64);
impl_word!("64", i64, AtomicI64);
impl_word!("ptr", usize, AtomicUsize);
impl_word!("ptr", isize, AtomicIsize);

/// A word-sized location updated with the target's native atomic instructions.
pub struct AtomicWord<W: Word> {
    inner: W::Atomic,
}

impl<W: Word> AtomicOps for AtomicWord<W> {
    type Value = W;

    #[inline]
    fn new(value: W) -> Self {
        Self {
            inner: W::new_atomic(value),
        }
    }

    #[inline]
    fn load(&self) -> W {
        W::atomic_load(&self.inner)
    }

    #[inline]
    fn store(&self, value: W) {
        W::atomic_store(&self.inner, value)
    }

    #[inline]
    fn compare_exchange(&self, expected: W, new: W) -> Result<W, W> {
        W::atomic_compare_exchange(&self.inner, expected, new)
    }

    #[inline]
    fn increment(&self) -> W {
        W::atomic_increment(&self.inner)
    }

    #[inline]
    fn decrement(&self) -> W {
        W::atomic_decrement(&self.inner)
    }
}

impl<W: Word + Default> Default for AtomicWord<W> {
    fn default() -> Self {
        Self::new(W::default())
    }
}

impl<W: Word> Debug for AtomicWord<W> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AtomicWord").field(&self.load()).finish()
    }
}
