//! A module which decides which synchronization primitives to use throughout the rest of the crate
//! depending on features and configuration options

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::atomic::{
            AtomicBool, AtomicI16, AtomicI32, AtomicI8, AtomicIsize, AtomicPtr, AtomicU16,
            AtomicU32, AtomicU8, AtomicUsize, Ordering,
        };
        #[cfg(target_has_atomic = "64")]
        pub(crate) use loom::sync::atomic::{AtomicI64, AtomicU64};
        #[cfg(feature = "std")]
        pub(crate) use loom::sync::{Arc, Condvar, Mutex};
        pub(crate) use loom::thread;
    } else if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::atomic::{
            AtomicBool, AtomicI16, AtomicI32, AtomicI8, AtomicIsize, AtomicPtr, AtomicU16,
            AtomicU32, AtomicU8, AtomicUsize, Ordering,
        };
        #[cfg(target_has_atomic = "64")]
        pub(crate) use shuttle::sync::atomic::{AtomicI64, AtomicU64};
        pub(crate) use shuttle::sync::{Arc, Condvar, Mutex};
        pub(crate) use shuttle::thread;
    } else {
        pub(crate) use core::sync::atomic::{
            AtomicBool, AtomicI16, AtomicI32, AtomicI8, AtomicIsize, AtomicPtr, AtomicU16,
            AtomicU32, AtomicU8, AtomicUsize, Ordering,
        };
        #[cfg(target_has_atomic = "64")]
        pub(crate) use core::sync::atomic::{AtomicI64, AtomicU64};
        #[cfg(feature = "std")]
        pub(crate) use std::sync::{Arc, Condvar, Mutex};
        #[cfg(feature = "std")]
        pub(crate) use std::thread;
    }
}

/// Hint that the current thread is busy-waiting.
///
/// Model checkers cannot make progress through a raw spin, so under loom and shuttle this hands
/// control back to the scheduler instead.
#[inline]
pub(crate) fn spin_loop() {
    cfg_if::cfg_if! {
        if #[cfg(any(loom, feature = "shuttle"))] {
            thread::yield_now();
        } else {
            core::hint::spin_loop();
        }
    }
}

/// Give up the rest of this thread's time slice, or spin once where there is no scheduler to
/// yield to.
#[inline]
pub(crate) fn yield_now() {
    cfg_if::cfg_if! {
        if #[cfg(any(loom, feature = "std"))] {
            thread::yield_now();
        } else {
            core::hint::spin_loop();
        }
    }
}
