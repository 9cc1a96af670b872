//! A multi-producer multi-consumer FIFO queue (Michael & Scott).
//!
//! The queue is a singly linked list of blocks from a [ConcurrentFreeList], threaded through
//! each block's tagged link. `head` always points at a dummy node whose value has already been
//! consumed, and `tail` points at the last node or lags at most one link behind it. Any thread
//! which sees `tail` lagging helps swing it forward before retrying its own operation.
//!
//! A popped node cannot go straight back to the free list. The thread which won the `head` CAS
//! still has to read the value out of the new dummy, while another popper may already be moving
//! `head` past that dummy. Every node therefore carries two claims. One is released when its
//! value has been taken, the other when `head` has moved past it. Whoever releases the second
//! claim frees the node.

use crate::atomic::{AtomicOps, AtomicWord};
use crate::backoff::Backoff;
use crate::err::AllocError;
use crate::freelist::{BackingAllocator, ConcurrentFreeList, FreeListConfig, SystemAllocator};
use crate::sync::{AtomicU8, Ordering};
use crate::tagged::{AtomicTaggedPointer, Handle, TaggedPointer};
use core::fmt::{Debug, Formatter};
use core::mem::MaybeUninit;
use core::ptr;
use tracing::trace;

/// The number of claims that must be released before a node is freed.
const CLAIMS_TO_FREE: u8 = 2;

pub(crate) struct QueueNode<T> {
    claims: AtomicU8,
    value: MaybeUninit<T>,
}

pub struct LockFreeQueue<T, B: BackingAllocator = SystemAllocator> {
    head: AtomicTaggedPointer<QueueNode<T>>,
    tail: AtomicTaggedPointer<QueueNode<T>>,
    len: AtomicWord<isize>,
    nodes: ConcurrentFreeList<QueueNode<T>, B>,
}

// SAFETY: values are handed from pusher to popper through the queue's atomic links.
unsafe impl<T: Send, B: BackingAllocator> Send for LockFreeQueue<T, B> {}
unsafe impl<T: Send, B: BackingAllocator> Sync for LockFreeQueue<T, B> {}

impl<T> LockFreeQueue<T> {
    /// An empty queue.
    ///
    /// Allocates the initial dummy node, and aborts through
    /// [alloc::alloc::handle_alloc_error] if even that fails. Use [LockFreeQueue::try_with_config]
    /// to handle that case.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// An empty queue with room for `capacity` values before it needs more memory.
    pub fn with_capacity(capacity: usize) -> Self {
        let config: FreeListConfig = FreeListConfig::default();
        let queue: Self = match Self::try_with_config(config, SystemAllocator) {
            Ok(queue) => queue,
            Err(alloc_error) => handle_alloc_error(alloc_error),
        };
        if let Err(alloc_error) = queue.nodes.grow(capacity) {
            handle_alloc_error(alloc_error);
        }
        queue
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, B: BackingAllocator> LockFreeQueue<T, B> {
    /// An empty queue whose nodes come from a free list built with `config` and `backing`.
    ///
    /// `config.max_blocks` bounds the queue's length plus one for the dummy node.
    pub fn try_with_config(config: FreeListConfig, backing: B) -> Result<Self, AllocError> {
        let nodes: ConcurrentFreeList<QueueNode<T>, B> = ConcurrentFreeList::with_backing(config, backing);
        let dummy: Handle<QueueNode<T>> = nodes.allocate()?;
        // the dummy's value is never read, so it starts with that claim already released
        // SAFETY: the dummy was just allocated and nothing else can see it yet.
        unsafe { init_node(nodes.value_ptr(dummy), CLAIMS_TO_FREE - 1, MaybeUninit::uninit()) };
        nodes.link(dummy).replace_handle(Handle::NULL);

        Ok(Self {
            head: AtomicTaggedPointer::new(TaggedPointer::new(dummy, Default::default())),
            tail: AtomicTaggedPointer::new(TaggedPointer::new(dummy, Default::default())),
            len: AtomicWord::new(0),
            nodes,
        })
    }

    /// Append `value` to the back of the queue.
    ///
    /// Fails only if no node can be allocated for it.
    pub fn push(&self, value: T) -> Result<(), AllocError> {
        let node: Handle<QueueNode<T>> = self.nodes.allocate()?;
        // SAFETY: the node was just allocated, so this thread owns it exclusively.
        unsafe { init_node(self.nodes.value_ptr(node), 0, MaybeUninit::new(value)) };
        self.nodes.link(node).replace_handle(Handle::NULL);

        let backoff: Backoff = Backoff::new();
        loop {
            let tail: TaggedPointer<QueueNode<T>> = self.tail.load();
            let tail_link: &AtomicTaggedPointer<QueueNode<T>> = self.nodes.link(tail.get());
            let next: TaggedPointer<QueueNode<T>> = tail_link.load();
            if tail != self.tail.load() {
                continue;
            }

            if next.is_null() {
                if tail_link.compare_and_swap(next, next.advance(node)) {
                    // if this fails, some other thread already swung tail past our node
                    self.tail.compare_and_swap(tail, tail.advance(node));
                    self.len.increment();
                    return Ok(());
                }
                trace!("Lost the race to link after tail {tail:?}");
            } else {
                trace!("Tail {tail:?} is lagging behind {next:?}; helping it forward");
                self.tail.compare_and_swap(tail, tail.advance(next.get()));
            }
            backoff.spin();
        }
    }

    /// Remove the value at the front of the queue, or return `None` if it is empty.
    pub fn pop(&self) -> Option<T> {
        let backoff: Backoff = Backoff::new();
        loop {
            let head: TaggedPointer<QueueNode<T>> = self.head.load();
            let tail: TaggedPointer<QueueNode<T>> = self.tail.load();
            let next: TaggedPointer<QueueNode<T>> = self.nodes.link(head.get()).load();
            if head != self.head.load() {
                continue;
            }

            if head.get() == tail.get() {
                if next.is_null() {
                    return None;
                }
                trace!("Tail {tail:?} is lagging behind {next:?}; helping it forward");
                self.tail.compare_and_swap(tail, tail.advance(next.get()));
            } else if !next.is_null() && self.head.compare_and_swap(head, head.advance(next.get())) {
                // `next` is now the dummy. Only this thread may read its value, and it cannot be
                // freed before this thread releases the value claim.
                // SAFETY: the pusher initialized the value before linking the node, and the
                // acquire load of the link above made that write visible.
                let value: T = unsafe { self.value_ptr(next.get()).read().assume_init() };
                self.len.decrement();
                self.release(next.get());
                self.release(head.get());
                return Some(value);
            } else {
                trace!("Lost the race to pop head {head:?}");
            }
            backoff.spin();
        }
    }

    /// Whether the queue held no values at the moment it was observed.
    pub fn is_empty(&self) -> bool {
        loop {
            let head: TaggedPointer<QueueNode<T>> = self.head.load();
            let next: TaggedPointer<QueueNode<T>> = self.nodes.link(head.get()).load();
            // a popped head may already be back on the free list, with an unrelated link
            if head == self.head.load() {
                return next.is_null();
            }
        }
    }

    /// The number of values in the queue. Only exact while no push or pop is in flight.
    pub fn len(&self) -> usize {
        self.len.load().max(0) as usize
    }

    fn value_ptr(&self, node: Handle<QueueNode<T>>) -> *mut MaybeUninit<T> {
        // SAFETY: only a field address is computed. No reference to the node is created.
        unsafe { ptr::addr_of_mut!((*self.nodes.value_ptr(node)).value) }
    }

    /// Release one claim on `node`, freeing it once both claims are released.
    fn release(&self, node: Handle<QueueNode<T>>) {
        // SAFETY: the node holds an initialized claims counter from the moment it is linked
        // until it is freed, and it is not freed before this claim is released.
        let claims: &AtomicU8 = unsafe { &*ptr::addr_of!((*self.nodes.value_ptr(node)).claims) };
        if claims.fetch_add(1, Ordering::AcqRel) + 1 == CLAIMS_TO_FREE {
            // SAFETY: both claims are released, so no other thread will touch this node again
            // until the free list hands it out.
            unsafe { self.nodes.deallocate(node) };
        }
    }
}

impl<T, B: BackingAllocator> Drop for LockFreeQueue<T, B> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T, B: BackingAllocator> Debug for LockFreeQueue<T, B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockFreeQueue")
            .field("head", &self.head.load())
            .field("tail", &self.tail.load())
            .field("len", &self.len())
            .finish()
    }
}

/// Write a fresh node into a block's value storage.
///
/// # Safety
///
/// The caller must own the block exclusively.
unsafe fn init_node<T>(node: *mut QueueNode<T>, claims: u8, value: MaybeUninit<T>) {
    node.write(QueueNode {
        claims: AtomicU8::new(claims),
        value,
    });
}

fn handle_alloc_error(alloc_error: AllocError) -> ! {
    let layout: alloc::alloc::Layout = match alloc_error {
        AllocError::OutOfMemory { size, align } => alloc::alloc::Layout::from_size_align(size, align)
            .unwrap_or_else(|_| alloc::alloc::Layout::new::<u8>()),
        AllocError::Exhausted { .. } => alloc::alloc::Layout::new::<u8>(),
    };
    alloc::alloc::handle_alloc_error(layout)
}
