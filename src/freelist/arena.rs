//! Chunked storage behind a [crate::ConcurrentFreeList].
//!
//! Slots live in chunks whose lengths double: chunk `k` holds `first_len << k` blocks, so a
//! slot index maps to its chunk and offset with a little bit arithmetic and chunks never move.
//! A chunk is requested from the [BackingAllocator] the first time an index inside it is handed
//! out. It is given back only when the arena is dropped. Any [Handle] ever handed out therefore
//! keeps pointing at readable memory for the arena's whole life, even after the slot is
//! recycled.

use crate::err::AllocError;
use crate::sync::{AtomicPtr, Ordering};
use crate::tagged::{AtomicTaggedPointer, Handle, MAX_HANDLES};
use alloc::alloc::Layout;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use tracing::{debug, instrument, trace};

/// Enough chunks to cover every index a [Handle] can carry, even with a first chunk of one.
pub(crate) const MAX_CHUNKS: usize = 33;

/// Where a [crate::ConcurrentFreeList] gets its memory when the free list runs dry.
///
/// Implementations may block and may fail. A failure is handed back to the caller of
/// `allocate` unchanged.
pub trait BackingAllocator: Send + Sync {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// # Safety
    ///
    /// `ptr` must have been returned by [BackingAllocator::allocate] on this allocator with the
    /// same `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global Rust allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAllocator;

impl BackingAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: chunk layouts are never zero-sized, since every block carries a link.
        let ptr: *mut u8 = unsafe { alloc::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

impl<B: BackingAllocator + ?Sized> BackingAllocator for &B {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        (**self).deallocate(ptr, layout)
    }
}

/// One fixed-size slot: an intrusive link header followed by room for a `T`.
///
/// The link outlives every use of the slot. While the block is free it chains the free list.
/// While it is lent to a queue or stack it chains that structure instead.
pub(crate) struct Block<T> {
    pub(crate) link: AtomicTaggedPointer<T>,
    pub(crate) value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Block<T> {
    fn new() -> Self {
        Self {
            link: AtomicTaggedPointer::null(),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

pub(crate) struct Arena<T, B: BackingAllocator> {
    chunks: [AtomicPtr<Block<T>>; MAX_CHUNKS],
    first_len: usize,
    first_len_log2: u32,
    /// No index at or above this is ever handed out.
    limit: usize,
    backing: B,
}

impl<T, B: BackingAllocator> Arena<T, B> {
    /// `first_len` is rounded up to a power of two. `limit` is clamped to what a [Handle] can
    /// address.
    pub(crate) fn new(first_len: usize, limit: usize, backing: B) -> Self {
        let first_len: usize = first_len.max(1).next_power_of_two();
        Self {
            chunks: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            first_len,
            first_len_log2: first_len.trailing_zeros(),
            limit: limit.min(MAX_HANDLES),
            backing,
        }
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    /// Map a slot index to its chunk number and offset within that chunk.
    fn locate(&self, index: usize) -> (usize, usize) {
        let shifted: u64 = index as u64 + self.first_len as u64;
        let most_significant_bit: u32 = 63 - shifted.leading_zeros();
        let chunk: usize = (most_significant_bit - self.first_len_log2) as usize;
        let offset: usize = (shifted - (1u64 << most_significant_bit)) as usize;
        (chunk, offset)
    }

    /// The index of the first slot in `chunk`.
    fn chunk_start(&self, chunk: usize) -> usize {
        ((self.first_len as u64) * ((1u64 << chunk) - 1)) as usize
    }

    /// The number of usable blocks in `chunk`, trimmed so no block past `limit` is allocated.
    fn chunk_len(&self, chunk: usize) -> usize {
        let full: u64 = (self.first_len as u64) << chunk;
        let remaining: u64 = (self.limit - self.chunk_start(chunk)) as u64;
        full.min(remaining) as usize
    }

    fn chunk_layout(&self, chunk: usize) -> Result<Layout, AllocError> {
        let len: usize = self.chunk_len(chunk);
        Layout::array::<Block<T>>(len).map_err(|_| AllocError::OutOfMemory {
            size: usize::MAX,
            align: core::mem::align_of::<Block<T>>(),
        })
    }

    /// Make sure the chunk holding slot `index` is backed by memory.
    ///
    /// `index` must be below `limit`. Several threads may race to back the same chunk: each
    /// allocates, one wins the CAS, and the losers give their memory straight back.
    #[instrument(level = "trace", skip(self))]
    pub(crate) fn ensure_backed(&self, index: usize) -> Result<(), AllocError> {
        debug_assert!(index < self.limit);
        let (chunk, _): (usize, usize) = self.locate(index);
        if !self.chunks[chunk].load(Ordering::Acquire).is_null() {
            return Ok(());
        }

        let layout: Layout = self.chunk_layout(chunk)?;
        let len: usize = self.chunk_len(chunk);
        let memory: NonNull<u8> = self.backing.allocate(layout)?;
        let blocks: *mut Block<T> = memory.as_ptr().cast::<Block<T>>();
        for offset in 0..len {
            // SAFETY: `memory` is a fresh allocation sized and aligned for `len` blocks.
            unsafe { blocks.add(offset).write(Block::new()) };
        }

        let cas_result: Result<*mut Block<T>, *mut Block<T>> = self.chunks[chunk].compare_exchange(
            ptr::null_mut(),
            blocks,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        match cas_result {
            Ok(_) => {
                debug!("Backed chunk {chunk} with {len} blocks ({} bytes)", layout.size());
            }
            Err(_) => {
                trace!("Lost the race to back chunk {chunk}; returning our allocation");
                // SAFETY: the blocks were never published, so nothing else can reference them.
                unsafe { self.release_chunk(blocks, len, layout) };
            }
        }
        Ok(())
    }

    /// The block behind `handle`.
    ///
    /// `handle` must be non-null and must have come from this arena, which guarantees its chunk
    /// is backed.
    #[inline]
    pub(crate) fn block(&self, handle: Handle<T>) -> &Block<T> {
        let index: u32 = handle.to_raw();
        debug_assert!((index as usize) < self.limit, "handle {handle:?} is not from this arena");
        let (chunk, offset): (usize, usize) = self.locate(index as usize);
        let blocks: *mut Block<T> = self.chunks[chunk].load(Ordering::Acquire);
        debug_assert!(!blocks.is_null(), "handle {handle:?} points into an unbacked chunk");
        // SAFETY: handed-out handles always point into a published chunk, and chunks are only
        // released on drop.
        unsafe { &*blocks.add(offset) }
    }

    /// Whether `index` falls inside a chunk that is already backed.
    pub(crate) fn is_backed(&self, index: usize) -> bool {
        if index >= self.limit {
            return false;
        }
        let (chunk, _): (usize, usize) = self.locate(index);
        !self.chunks[chunk].load(Ordering::Acquire).is_null()
    }

    /// # Safety
    ///
    /// `blocks` must be an unpublished or no longer reachable chunk of `len` blocks allocated
    /// with `layout`.
    unsafe fn release_chunk(&self, blocks: *mut Block<T>, len: usize, layout: Layout) {
        for offset in 0..len {
            ptr::drop_in_place(blocks.add(offset));
        }
        self.backing
            .deallocate(NonNull::new_unchecked(blocks.cast::<u8>()), layout);
    }
}

impl<T, B: BackingAllocator> Drop for Arena<T, B> {
    fn drop(&mut self) {
        for chunk in 0..MAX_CHUNKS {
            let blocks: *mut Block<T> = self.chunks[chunk].load(Ordering::Acquire);
            if blocks.is_null() {
                continue;
            }
            let len: usize = self.chunk_len(chunk);
            match self.chunk_layout(chunk) {
                // SAFETY: we have exclusive access, so no handle into this chunk can be used
                // again.
                Ok(layout) => unsafe { self.release_chunk(blocks, len, layout) },
                Err(_) => unreachable!("a backed chunk always has a valid layout"),
            }
        }
    }
}
