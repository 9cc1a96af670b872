//! A multi-producer multi-consumer LIFO stack (Treiber).
//!
//! Each value lives in a block of a [ConcurrentFreeList], and the block's link points at the
//! node below it. `top` is an [AtomicTaggedPointer] whose tag advances on every push and pop,
//! which makes a popper holding a stale `top` fail its CAS once that node has been recycled.

use crate::atomic::{AtomicOps, AtomicWord};
use crate::backoff::Backoff;
use crate::err::AllocError;
use crate::freelist::{BackingAllocator, ConcurrentFreeList, FreeListConfig, SystemAllocator};
use crate::tagged::{AtomicTaggedPointer, Handle, TaggedPointer};
use alloc::vec::Vec;
use core::fmt::{Debug, Formatter};
use tracing::trace;

pub struct LockFreeStack<T, B: BackingAllocator = SystemAllocator> {
    top: AtomicTaggedPointer<T>,
    len: AtomicWord<isize>,
    nodes: ConcurrentFreeList<T, B>,
}

// SAFETY: values are handed from pusher to popper through the stack's atomic links.
unsafe impl<T: Send, B: BackingAllocator> Send for LockFreeStack<T, B> {}
unsafe impl<T: Send, B: BackingAllocator> Sync for LockFreeStack<T, B> {}

impl<T> LockFreeStack<T> {
    pub fn new() -> Self {
        Self::with_config(FreeListConfig::default(), SystemAllocator)
    }

    /// An empty stack with room for `capacity` values before it needs more memory.
    ///
    /// Preallocation is best effort: if it fails the stack simply starts smaller.
    pub fn with_capacity(capacity: usize) -> Self {
        let stack: Self = Self::new();
        if let Err(alloc_error) = stack.nodes.grow(capacity) {
            trace!("Could not preallocate {capacity} stack nodes: {alloc_error}");
        }
        stack
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, B: BackingAllocator> LockFreeStack<T, B> {
    /// An empty stack whose nodes come from a free list built with `config` and `backing`.
    pub fn with_config(config: FreeListConfig, backing: B) -> Self {
        Self {
            top: AtomicTaggedPointer::null(),
            len: AtomicWord::new(0),
            nodes: ConcurrentFreeList::with_backing(config, backing),
        }
    }

    pub fn push(&self, value: T) -> Result<(), AllocError> {
        let node: Handle<T> = self.nodes.allocate_with(value)?;
        let link: &AtomicTaggedPointer<T> = self.nodes.link(node);
        let backoff: Backoff = Backoff::new();
        let mut top: TaggedPointer<T> = self.top.load();
        loop {
            link.replace_handle(top.get());
            match self.top.compare_exchange(top, top.advance(node)) {
                Ok(_) => {
                    self.len.increment();
                    return Ok(());
                }
                Err(actual) => {
                    trace!("Stack push lost a race at {top:?}, now {actual:?}");
                    top = actual;
                    backoff.spin();
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let backoff: Backoff = Backoff::new();
        let mut top: TaggedPointer<T> = self.top.load();
        loop {
            if top.is_null() {
                return None;
            }
            // a stale `top` may already be recycled; its link is still readable and the tag
            // check rejects the CAS
            let next: Handle<T> = self.nodes.link(top.get()).load().get();
            match self.top.compare_exchange(top, top.advance(next)) {
                Ok(_) => {
                    self.len.decrement();
                    // SAFETY: winning the CAS unlinked the node, so this thread owns it, and the
                    // pusher initialized its value before publishing it.
                    return Some(unsafe { self.nodes.take(top.get()) });
                }
                Err(actual) => {
                    trace!("Stack pop lost a race at {top:?}, now {actual:?}");
                    top = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Whether the stack held no values at the moment it was observed.
    pub fn is_empty(&self) -> bool {
        self.top.load().is_null()
    }

    /// The number of values on the stack. Only exact while no push or pop is in flight.
    pub fn len(&self) -> usize {
        self.len.load().max(0) as usize
    }

    /// Pop every value, top first.
    pub fn drain(&self) -> Vec<T> {
        let mut values: Vec<T> = Vec::with_capacity(self.len());
        while let Some(value) = self.pop() {
            values.push(value);
        }
        values
    }
}

impl<T, B: BackingAllocator> Drop for LockFreeStack<T, B> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T, B: BackingAllocator> Debug for LockFreeStack<T, B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("top", &self.top.load())
            .field("len", &self.len())
            .finish()
    }
}
