#![allow(dead_code)]

use lfkit::{LockFreeQueue, LockFreeStack, RwSpinLock};
use std::collections::HashSet;
use tracing::debug;

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::atomic::{AtomicUsize, Ordering};
        pub(crate) use loom::sync::Arc;
        pub(crate) use loom::thread;
    } else if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::atomic::{AtomicUsize, Ordering};
        pub(crate) use shuttle::sync::Arc;
        pub(crate) use shuttle::thread;
    } else if #[cfg(feature = "std")] {
        pub(crate) use std::sync::atomic::{AtomicUsize, Ordering};
        pub(crate) use std::sync::Arc;
        pub(crate) use std::thread;
    }
}

/// Value `sequence` pushed by `producer`, encoded so every pushed value is distinct.
fn encode(producer: usize, sequence: usize, per_producer: usize) -> usize {
    producer * per_producer + sequence
}

/// Producers push distinct values while consumers pop until every producer is done and the
/// queue is empty. Checks that nothing is lost or duplicated, and that each consumer sees each
/// producer's values in push order.
pub(crate) fn queue_scenario<const PRODUCERS: usize, const CONSUMERS: usize>(per_producer: usize) {
    let queue: Arc<LockFreeQueue<usize>> = Arc::new(LockFreeQueue::new());
    let producers_done: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let producer_handles: Vec<thread::JoinHandle<()>> = (0..PRODUCERS)
        .map(|producer| {
            let queue: Arc<LockFreeQueue<usize>> = queue.clone();
            let producers_done: Arc<AtomicUsize> = producers_done.clone();
            thread::spawn(move || {
                for sequence in 0..per_producer {
                    queue.push(encode(producer, sequence, per_producer)).unwrap();
                }
                producers_done.fetch_add(1, Ordering::AcqRel);
            })
        })
        .collect();

    let consumer_handles: Vec<thread::JoinHandle<Vec<usize>>> = (0..CONSUMERS)
        .map(|_| {
            let queue: Arc<LockFreeQueue<usize>> = queue.clone();
            let producers_done: Arc<AtomicUsize> = producers_done.clone();
            thread::spawn(move || {
                let mut popped: Vec<usize> = Vec::new();
                loop {
                    // read the flag first, so an empty queue afterwards really is final
                    let all_done: bool = producers_done.load(Ordering::Acquire) == PRODUCERS;
                    match queue.pop() {
                        Some(value) => popped.push(value),
                        None if all_done => return popped,
                        None => thread::yield_now(),
                    }
                }
            })
        })
        .collect();

    producer_handles
        .into_iter()
        .for_each(|handle| handle.join().expect("A producer panicked"));
    let popped: Vec<Vec<usize>> = consumer_handles
        .into_iter()
        .map(|handle| handle.join().expect("A consumer panicked"))
        .collect();

    let mut seen: HashSet<usize> = HashSet::new();
    let mut sum: usize = 0;
    for values in &popped {
        let mut last: Vec<Option<usize>> = vec![None; PRODUCERS];
        for &value in values {
            assert!(seen.insert(value), "value {value} popped twice");
            sum += value;
            let (producer, sequence): (usize, usize) = (value / per_producer, value % per_producer);
            if let Some(previous) = last[producer] {
                assert!(sequence > previous, "producer {producer}'s values popped out of order");
            }
            last[producer] = Some(sequence);
        }
    }
    let total: usize = PRODUCERS * per_producer;
    assert_eq!(seen.len(), total);
    assert_eq!(sum, total * (total - 1) / 2);
    assert!(queue.is_empty());
    debug!("Queue scenario popped {total} values across {CONSUMERS} consumers");
}

/// Each thread pushes its values and then pops the same number. Everything pushed comes back
/// out exactly once.
pub(crate) fn stack_scenario<const THREADS: usize>(per_thread: usize) {
    let stack: Arc<LockFreeStack<usize>> = Arc::new(LockFreeStack::new());

    let handles: Vec<thread::JoinHandle<Vec<usize>>> = (0..THREADS)
        .map(|thread_index| {
            let stack: Arc<LockFreeStack<usize>> = stack.clone();
            thread::spawn(move || {
                for i in 0..per_thread {
                    stack.push(encode(thread_index, i, per_thread)).unwrap();
                }
                (0..per_thread).filter_map(|_| stack.pop()).collect()
            })
        })
        .collect();

    let mut all: Vec<usize> = handles
        .into_iter()
        .flat_map(|handle| handle.join().expect("A thread panicked"))
        .collect();
    all.extend(stack.drain());
    all.sort_unstable();
    assert_eq!(all, (0..THREADS * per_thread).collect::<Vec<usize>>());
}

/// Readers and writers take turns on one lock. A writer never overlaps anyone, at most
/// `max_readers` readers are inside at once, and no write is lost.
pub(crate) fn rwlock_scenario<const THREADS: usize>(max_readers: usize, rounds: usize) {
    let lock: Arc<RwSpinLock<usize>> = Arc::new(RwSpinLock::with_max_readers(0, max_readers));
    let readers_inside: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));

    let handles: Vec<thread::JoinHandle<usize>> = (0..THREADS)
        .map(|thread_index| {
            let lock: Arc<RwSpinLock<usize>> = lock.clone();
            let readers_inside: Arc<AtomicUsize> = readers_inside.clone();
            thread::spawn(move || {
                let mut writes: usize = 0;
                for round in 0..rounds {
                    if (thread_index + round) % 2 == 0 {
                        let mut guard = lock.write();
                        assert_eq!(readers_inside.load(Ordering::SeqCst), 0);
                        *guard += 1;
                        writes += 1;
                    } else {
                        let guard = lock.read();
                        let inside: usize = readers_inside.fetch_add(1, Ordering::SeqCst) + 1;
                        assert!(inside <= max_readers);
                        assert!(!lock.raw().is_locked_write());
                        let _ = *guard;
                        readers_inside.fetch_sub(1, Ordering::SeqCst);
                    }
                }
                writes
            })
        })
        .collect();

    let writes: usize = handles
        .into_iter()
        .map(|handle| handle.join().expect("A thread panicked"))
        .sum();
    assert_eq!(*lock.read(), writes);
}
