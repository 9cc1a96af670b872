//! A lock-free allocator of fixed-size blocks.
//!
//! Free blocks form an intrusive Treiber stack threaded through each block's link header. The
//! stack's `top` is an [AtomicTaggedPointer], and every push and pop advances its tag, so a
//! thread holding a stale view of `top` cannot pop a block that has since been recycled.
//!
//! When the free list is empty, a never-used slot is reserved from the arena instead, and the
//! arena asks the [BackingAllocator] for memory if the slot's chunk is not backed yet. That
//! is the only path that can block or fail.

use crate::atomic::{AtomicOps, AtomicWord};
use crate::backoff::Backoff;
use crate::err::AllocError;
use crate::tagged::{AtomicTaggedPointer, Handle, TaggedPointer, MAX_HANDLES};
use core::fmt::{Debug, Formatter};
use core::ptr::NonNull;
use tracing::{instrument, trace};

mod arena;

pub(crate) use arena::Block;
pub use arena::{BackingAllocator, SystemAllocator};
use arena::Arena;

/// Sizing for a [ConcurrentFreeList]'s arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeListConfig {
    /// The number of blocks in the first chunk requested from the backing allocator. Every
    /// later chunk is twice the size of the previous one. Rounded up to a power of two.
    pub first_chunk_len: usize,
    /// The most blocks that may ever exist at once. Allocating past this fails with
    /// [AllocError::Exhausted]. Clamped to what a [Handle] can address.
    pub max_blocks: usize,
}

impl Default for FreeListConfig {
    fn default() -> Self {
        Self {
            first_chunk_len: 32,
            max_blocks: MAX_HANDLES,
        }
    }
}

/// A lock-free pool of blocks which can each hold one `T`.
///
/// Blocks are named by [Handle]s. A freshly allocated block's value is uninitialized and a
/// deallocated block's value is not dropped: what lives in a block is the caller's business.
/// [ConcurrentFreeList::allocate_with] and [ConcurrentFreeList::take] cover the common
/// write-then-read pattern.
pub struct ConcurrentFreeList<T, B: BackingAllocator = SystemAllocator> {
    top: AtomicTaggedPointer<T>,
    /// The number of arena slots ever handed out, free or not.
    reserved: AtomicWord<usize>,
    live: AtomicWord<usize>,
    arena: Arena<T, B>,
}

// SAFETY: blocks move between threads only through the free list's atomic links, and a block's
// value is only touched by whichever thread currently owns the block.
unsafe impl<T: Send, B: BackingAllocator> Send for ConcurrentFreeList<T, B> {}
unsafe impl<T: Send, B: BackingAllocator> Sync for ConcurrentFreeList<T, B> {}

impl<T> ConcurrentFreeList<T> {
    pub fn new() -> Self {
        Self::with_config(FreeListConfig::default())
    }

    pub fn with_config(config: FreeListConfig) -> Self {
        Self::with_backing(config, SystemAllocator)
    }
}

impl<T> Default for ConcurrentFreeList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, B: BackingAllocator> ConcurrentFreeList<T, B> {
    pub fn with_backing(config: FreeListConfig, backing: B) -> Self {
        Self {
            top: AtomicTaggedPointer::null(),
            reserved: AtomicWord::new(0),
            live: AtomicWord::new(0),
            arena: Arena::new(config.first_chunk_len, config.max_blocks, backing),
        }
    }

    /// Hand out a block, reusing a free one if there is any.
    pub fn allocate(&self) -> Result<Handle<T>, AllocError> {
        let handle: Handle<T> = match self.pop_free() {
            Some(handle) => handle,
            None => self.reserve_fresh()?,
        };
        self.live.increment();
        Ok(handle)
    }

    /// Allocate a block and move `value` into it.
    pub fn allocate_with(&self, value: T) -> Result<Handle<T>, AllocError> {
        let handle: Handle<T> = self.allocate()?;
        // SAFETY: the block was just allocated, so this thread owns it exclusively.
        unsafe { self.value_ptr(handle).write(value) };
        Ok(handle)
    }

    /// Return a block to the free list. Its value is not dropped.
    ///
    /// # Safety
    ///
    /// `handle` must have been allocated from this free list, must not already be free, and
    /// must not be used again until it is handed out by a later allocation.
    pub unsafe fn deallocate(&self, handle: Handle<T>) {
        debug_assert!(!handle.is_null(), "deallocating the null handle");
        self.push_free(handle);
        self.live.decrement();
    }

    /// Move the value out of a block and deallocate it.
    ///
    /// # Safety
    ///
    /// As for [ConcurrentFreeList::deallocate], and the block must hold an initialized `T`.
    pub unsafe fn take(&self, handle: Handle<T>) -> T {
        let value: T = self.value_ptr(handle).read();
        self.deallocate(handle);
        value
    }

    /// A pointer to the value storage of a block, or `None` if `handle` never came from this
    /// free list.
    ///
    /// Reading or writing through it is only sound while the caller owns the block.
    pub fn as_ptr(&self, handle: Handle<T>) -> Option<NonNull<T>> {
        let index: usize = handle.index()? as usize;
        if index >= self.reserved.load() || !self.arena.is_backed(index) {
            return None;
        }
        NonNull::new(self.value_ptr(handle))
    }

    /// Put `additional` never-used blocks on the free list ahead of demand.
    #[instrument(level = "trace", skip(self))]
    pub fn grow(&self, additional: usize) -> Result<(), AllocError> {
        for _ in 0..additional {
            let handle: Handle<T> = self.reserve_fresh()?;
            self.push_free(handle);
        }
        Ok(())
    }

    /// The number of blocks currently allocated and not yet deallocated.
    pub fn live_blocks(&self) -> usize {
        self.live.load()
    }

    /// The number of blocks that exist, live or free.
    pub fn capacity(&self) -> usize {
        self.reserved.load()
    }

    /// The most blocks that may ever exist at once.
    pub fn max_blocks(&self) -> usize {
        self.arena.limit()
    }

    /// The size in bytes of every block, including its link header.
    pub const fn block_size() -> usize {
        core::mem::size_of::<Block<T>>()
    }

    #[inline]
    pub(crate) fn link(&self, handle: Handle<T>) -> &AtomicTaggedPointer<T> {
        &self.arena.block(handle).link
    }

    #[inline]
    pub(crate) fn value_ptr(&self, handle: Handle<T>) -> *mut T {
        self.arena.block(handle).value.get().cast::<T>()
    }

    /// Pop the top of the free list: CAS `top` from `(h, tag)` to `(h.link, tag + 1)`.
    fn pop_free(&self) -> Option<Handle<T>> {
        let backoff: Backoff = Backoff::new();
        let mut top: TaggedPointer<T> = self.top.load();
        loop {
            if top.is_null() {
                return None;
            }
            // `top` may already have been popped and reused by another thread. Its link is still
            // readable, and the tag check below rejects the CAS if so.
            let next: Handle<T> = self.link(top.get()).load().get();
            match self.top.compare_exchange(top, top.advance(next)) {
                Ok(_) => return Some(top.get()),
                Err(actual) => {
                    trace!("Free list pop lost a race at {top:?}, now {actual:?}");
                    top = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Push onto the free list: link `handle` to the current top, then CAS `top` from
    /// `(old, tag)` to `(handle, tag + 1)`.
    fn push_free(&self, handle: Handle<T>) {
        let backoff: Backoff = Backoff::new();
        let link: &AtomicTaggedPointer<T> = self.link(handle);
        let mut top: TaggedPointer<T> = self.top.load();
        loop {
            link.replace_handle(top.get());
            match self.top.compare_exchange(top, top.advance(handle)) {
                Ok(_) => return,
                Err(actual) => {
                    trace!("Free list push lost a race at {top:?}, now {actual:?}");
                    top = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Claim a slot that has never been handed out, backing its chunk first if needed.
    ///
    /// The chunk is backed before the slot is claimed, so a backing failure leaves nothing
    /// half-reserved.
    fn reserve_fresh(&self) -> Result<Handle<T>, AllocError> {
        let mut index: usize = self.reserved.load();
        loop {
            if index >= self.arena.limit() {
                return Err(AllocError::Exhausted {
                    max_blocks: self.arena.limit(),
                });
            }
            self.arena.ensure_backed(index)?;
            match self.reserved.compare_exchange(index, index + 1) {
                Ok(_) => return Ok(Handle::from_index(index as u32)),
                Err(actual) => index = actual,
            }
        }
    }
}

impl<T, B: BackingAllocator> Debug for ConcurrentFreeList<T, B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConcurrentFreeList")
            .field("top", &self.top.load())
            .field("capacity", &self.capacity())
            .field("live_blocks", &self.live_blocks())
            .finish()
    }
}
