//! Lock-free building blocks.
//!
//! - [AtomicOps]: strong CAS, increment and decrement over 1 to 8 byte words, with
//!   [AdjacentWord] for updating two adjacent halves as one unit.
//! - [TaggedPointer]: a slot [Handle] paired with an ABA-detecting [Tag].
//! - [ConcurrentFreeList]: a lock-free pool of fixed-size blocks.
//! - [LockFreeQueue] and [LockFreeStack]: MPMC containers built on the free list.
//! - [RwSpinLock]: a writer-preferring reader/writer spinlock.
//! - [ThreadPool]: worker threads fed from a [LockFreeQueue], with pluggable idle and
//!   participation policies.
//!
//! Without the `std` feature, the crate is `no_std`. The free list and the containers need
//! `alloc`. The thread pool, the global [Context] and the lock-based [atomic::fallback] need
//! `std`. Tagged pointers pack into one 8-byte word, so on targets without 64-bit atomics
//! they, the free list and the containers also need `std` for the fallback.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod atomic;
pub mod backoff;
#[cfg(feature = "std")]
pub mod context;
pub mod err;
#[cfg(all(feature = "alloc", any(target_has_atomic = "64", feature = "std")))]
pub mod freelist;
#[cfg(all(feature = "std", not(loom)))]
pub mod pool;
#[cfg(all(feature = "alloc", any(target_has_atomic = "64", feature = "std")))]
pub mod queue;
pub mod rwlock;
#[cfg(all(feature = "alloc", any(target_has_atomic = "64", feature = "std")))]
pub mod stack;
mod sync;
#[cfg(any(target_has_atomic = "64", feature = "std"))]
pub mod tagged;
#[cfg(all(test, feature = "std", not(feature = "shuttle"), not(loom)))]
mod test_support;

pub use atomic::{AdjacentWord, AtomicOps, AtomicWord, Half};
pub use backoff::Backoff;
#[cfg(feature = "std")]
pub use context::Context;
pub use err::AllocError;
#[cfg(feature = "std")]
pub use err::{PoolError, TaskError, TaskFailure};
#[cfg(all(feature = "alloc", any(target_has_atomic = "64", feature = "std")))]
pub use freelist::{BackingAllocator, ConcurrentFreeList, FreeListConfig, SystemAllocator};
#[cfg(all(feature = "std", not(loom)))]
pub use pool::{Delegate, IdlePolicy, Participate, ParticipationPolicy, Sleep, Spin, ThreadPool, ThreadPoolConfig};
#[cfg(all(feature = "alloc", any(target_has_atomic = "64", feature = "std")))]
pub use queue::LockFreeQueue;
pub use rwlock::{RawRwSpinLock, RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard, DEFAULT_MAX_READERS};
#[cfg(all(feature = "alloc", any(target_has_atomic = "64", feature = "std")))]
pub use stack::LockFreeStack;
#[cfg(any(target_has_atomic = "64", feature = "std"))]
pub use tagged::{AtomicTaggedPointer, Handle, Tag, TaggedPointer, MAX_HANDLES};
