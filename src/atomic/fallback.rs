//! The last-resort [AtomicOps] implementation for words the target cannot update atomically.
//!
//! Every [LockedWord] in the process serializes on the single lock owned by
//! [crate::Context]. This is always correct. It is also very slow under contention, because
//! unrelated words contend for the same lock and every access may block in the OS. A warning is
//! logged the first time one is created.

use crate::atomic::{AtomicOps, Integer};
use crate::context::Context;
use core::cell::UnsafeCell;
use core::fmt::{Debug, Formatter};

pub struct LockedWord<V: Integer> {
    value: UnsafeCell<V>,
}

// SAFETY: `value` is only accessed while holding the global fallback lock.
unsafe impl<V: Integer> Send for LockedWord<V> {}
unsafe impl<V: Integer> Sync for LockedWord<V> {}

impl<V: Integer> LockedWord<V> {
    fn with_lock<R>(&self, f: impl FnOnce(&mut V) -> R) -> R {
        let _guard = Context::global().lock_fallback();
        // SAFETY: the fallback lock is held, so no other thread is touching `value`.
        let value: &mut V = unsafe { &mut *self.value.get() };
        f(value)
    }
}

impl<V: Integer> AtomicOps for LockedWord<V> {
    type Value = V;

    fn new(value: V) -> Self {
        Context::global().warn_fallback_in_use(core::any::type_name::<V>());
        Self {
            value: UnsafeCell::new(value),
        }
    }

    fn load(&self) -> V {
        self.with_lock(|value| *value)
    }

    fn store(&self, new: V) {
        self.with_lock(|value| *value = new)
    }

    fn compare_exchange(&self, expected: V, new: V) -> Result<V, V> {
        self.with_lock(|value| {
            let current: V = *value;
            if current == expected {
                *value = new;
                Ok(current)
            } else {
                Err(current)
            }
        })
    }

    fn increment(&self) -> V {
        self.with_lock(|value| {
            *value = value.wrapping_increment();
            *value
        })
    }

    fn decrement(&self) -> V {
        self.with_lock(|value| {
            *value = value.wrapping_decrement();
            *value
        })
    }
}

impl<V: Integer> Debug for LockedWord<V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("LockedWord").field(&self.load()).finish()
    }
}
