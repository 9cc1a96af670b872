#![cfg(all(feature = "std", not(feature = "shuttle"), not(loom)))]

mod common;

use lfkit::{
    AllocError, BackingAllocator, ConcurrentFreeList, FreeListConfig, Handle, LockFreeQueue, PoolError,
    TaskError, ThreadPool, ThreadPoolConfig,
};
use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use test_log::test;

/// Hands out memory from the system allocator and keeps count of what is outstanding.
#[derive(Default)]
struct TrackingAllocator {
    outstanding_bytes: AtomicUsize,
    outstanding_chunks: AtomicUsize,
    chunks_allocated: AtomicUsize,
}

impl BackingAllocator for TrackingAllocator {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: chunk layouts are never zero-sized.
        let ptr: *mut u8 = unsafe { System.alloc(layout) };
        let ptr: NonNull<u8> = NonNull::new(ptr).ok_or(AllocError::OutOfMemory {
            size: layout.size(),
            align: layout.align(),
        })?;
        self.outstanding_bytes.fetch_add(layout.size(), Ordering::SeqCst);
        self.outstanding_chunks.fetch_add(1, Ordering::SeqCst);
        self.chunks_allocated.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        self.outstanding_bytes.fetch_sub(layout.size(), Ordering::SeqCst);
        self.outstanding_chunks.fetch_sub(1, Ordering::SeqCst);
        System.dealloc(ptr.as_ptr(), layout);
    }
}

#[test]
fn two_producers_two_consumers_hundred_thousand_each() {
    common::queue_scenario::<2, 2>(100_000);
}

#[test]
fn many_threads_stack() {
    common::stack_scenario::<8>(20_000);
}

#[test]
fn many_threads_rwlock() {
    common::rwlock_scenario::<8>(3, 5_000);
}

#[test]
fn free_list_returns_every_chunk_to_its_backing_allocator() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 5_000;

    let tracking: TrackingAllocator = TrackingAllocator::default();
    {
        let free_list: ConcurrentFreeList<[u64; 4], &TrackingAllocator> =
            ConcurrentFreeList::with_backing(FreeListConfig { first_chunk_len: 8, ..FreeListConfig::default() }, &tracking);
        thread::scope(|scope| {
            for thread_index in 0..THREADS {
                let free_list: &ConcurrentFreeList<[u64; 4], &TrackingAllocator> = &free_list;
                scope.spawn(move || {
                    let handles: Vec<Handle<[u64; 4]>> = (0..PER_THREAD)
                        .map(|i| free_list.allocate_with([thread_index as u64, i as u64, 0, 0]).unwrap())
                        .collect();
                    // deallocate in a different order from allocation
                    for (i, handle) in handles.into_iter().enumerate().rev() {
                        let value: [u64; 4] = unsafe { free_list.take(handle) };
                        assert_eq!(value, [thread_index as u64, i as u64, 0, 0]);
                    }
                });
            }
        });
        assert_eq!(free_list.live_blocks(), 0);
        assert!(free_list.capacity() >= PER_THREAD);
        assert!(tracking.outstanding_chunks.load(Ordering::SeqCst) > 0);
    }
    assert_eq!(tracking.outstanding_bytes.load(Ordering::SeqCst), 0);
    assert_eq!(tracking.outstanding_chunks.load(Ordering::SeqCst), 0);
    assert!(tracking.chunks_allocated.load(Ordering::SeqCst) > 0);
}

#[test]
fn queue_on_a_tracking_allocator_leaks_nothing() {
    let tracking: TrackingAllocator = TrackingAllocator::default();
    {
        let queue: LockFreeQueue<String, &TrackingAllocator> =
            LockFreeQueue::try_with_config(FreeListConfig::default(), &tracking).unwrap();
        thread::scope(|scope| {
            for thread_index in 0..4 {
                let queue: &LockFreeQueue<String, &TrackingAllocator> = &queue;
                scope.spawn(move || {
                    for i in 0..10_000 {
                        queue.push(format!("{thread_index}:{i}")).unwrap();
                        if i % 3 == 0 {
                            queue.pop();
                        }
                    }
                });
            }
        });
        assert!(!queue.is_empty());
    }
    assert_eq!(tracking.outstanding_bytes.load(Ordering::SeqCst), 0);
}

#[test]
fn pool_counts_every_task_and_reports_the_failure_once() {
    const TASKS: usize = 50_000;
    let pool: ThreadPool = ThreadPool::new(ThreadPoolConfig::default()).unwrap();
    assert!(pool.number_of_threads() >= 1);

    let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
    for i in 0..TASKS {
        let counter: Arc<AtomicUsize> = counter.clone();
        pool.add_fallible_task(move || {
            counter.fetch_add(1, Ordering::Relaxed);
            if i == TASKS / 2 {
                Err(format!("task {i} failed"))
            } else {
                Ok(())
            }
        })
        .unwrap();
    }

    match pool.complete_all_tasks() {
        Err(PoolError::TasksFailed(failures)) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].error, TaskError::Failed(format!("task {} failed", TASKS / 2)));
        }
        other => panic!("expected exactly one task failure, got {other:?}"),
    }
    assert_eq!(counter.load(Ordering::Relaxed), TASKS);
    assert_eq!(pool.complete_all_tasks(), Ok(()));
    pool.shutdown().unwrap();
}
