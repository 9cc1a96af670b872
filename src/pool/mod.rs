//! A fixed crew of worker threads fed from a [LockFreeQueue].
//!
//! Each worker loops between `Idle` and `Running`: pop a task and run it, or ask the
//! [IdlePolicy] to wait until there is something to pop. When the pool stops, the worker leaves
//! the loop and is joined. A task that panics or returns an error is recorded and reported to
//! the next caller of [ThreadPool::complete_all_tasks]. The worker carries on with the next
//! task.

use crate::atomic::{AtomicOps, AtomicWord};
use crate::backoff::Backoff;
use crate::context::Context;
use crate::err::{PoolError, TaskFailure};
use crate::freelist::{FreeListConfig, SystemAllocator};
use crate::queue::LockFreeQueue;
use crate::stack::LockFreeStack;
use crate::sync::{thread, Arc, AtomicBool, Ordering};
use core::fmt::{Debug, Display, Formatter};
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

mod policy;
mod task;

pub use policy::{Delegate, IdlePolicy, Participate, ParticipationPolicy, Sleep, Spin};
use task::Task;

/// Construction options for a [ThreadPool].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThreadPoolConfig {
    /// The number of worker threads. 0 means one per available CPU.
    pub number_of_threads: usize,
    /// The most tasks that may wait in the queue at once. 0 means unbounded.
    pub max_tasks_in_queue: usize,
    /// Workers are named `{thread_name_prefix}-{pool id}-{worker index}`.
    pub thread_name_prefix: String,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            number_of_threads: 0,
            max_tasks_in_queue: 0,
            thread_name_prefix: String::from("lfkit-worker"),
        }
    }
}

/// State shared between the pool handle and its workers.
struct Shared<I: IdlePolicy> {
    queue: LockFreeQueue<Task>,
    queued: AtomicWord<usize>,
    running: AtomicWord<usize>,
    /// Tasks accepted and not yet finished, whether queued or running.
    unfinished: AtomicWord<usize>,
    shutdown: AtomicBool,
    abort: AtomicBool,
    failures: LockFreeStack<TaskFailure>,
    idle: I,
}

impl<I: IdlePolicy> Shared<I> {
    /// Pop one task and run it. Returns `false` if the queue was empty.
    ///
    /// `worker` is `None` when a submitting thread is helping out.
    fn run_one(&self, worker: Option<usize>) -> bool {
        let task: Task = match self.queue.pop() {
            Some(task) => task,
            None => return false,
        };
        self.queued.decrement();
        self.running.increment();
        let result = task.run();
        self.running.decrement();

        if let Err(task_error) = result {
            warn!("Task failed on {worker:?}: {task_error}");
            let failure: TaskFailure = TaskFailure {
                worker,
                error: task_error,
            };
            if let Err(alloc_error) = self.failures.push(failure) {
                error!("Could not record a task failure: {alloc_error}");
            }
        }
        self.finish_one();
        true
    }

    fn finish_one(&self) {
        if self.unfinished.decrement() == 0 {
            self.idle.completed();
        }
    }

    fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire) || self.abort.load(Ordering::Acquire)
    }
}

#[instrument(level = "trace", skip_all, fields(worker = index))]
fn worker_loop<I: IdlePolicy>(shared: Arc<Shared<I>>, index: usize) {
    debug!("Worker {index} started");
    loop {
        if shared.abort.load(Ordering::Acquire) {
            break;
        }
        if shared.run_one(Some(index)) {
            continue;
        }
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        shared
            .idle
            .wait_for_work(&|| shared.queued.load() > 0 || shared.is_stopping());
    }
    debug!("Worker {index} stopped");
}

/// A pool of worker threads running queued closures.
///
/// `I` decides how idle threads wait and `P` whether a thread blocked in the pool runs tasks
/// itself. Both are passed in by value at construction.
pub struct ThreadPool<I: IdlePolicy = Sleep, P: ParticipationPolicy = Delegate> {
    shared: Arc<Shared<I>>,
    workers: Vec<thread::JoinHandle<()>>,
    participation: P,
    max_tasks_in_queue: usize,
    id: usize,
}

impl ThreadPool {
    /// A pool with sleeping idle workers and submitters that never run tasks themselves.
    pub fn new(config: ThreadPoolConfig) -> Result<Self, PoolError> {
        Self::with_policies(config, Sleep::new(), Delegate)
    }
}

impl<I: IdlePolicy, P: ParticipationPolicy> ThreadPool<I, P> {
    pub fn with_policies(config: ThreadPoolConfig, idle: I, participation: P) -> Result<Self, PoolError> {
        Self::with_queue_config(config, FreeListConfig::default(), idle, participation)
    }

    fn with_queue_config(
        config: ThreadPoolConfig,
        queue_config: FreeListConfig,
        idle: I,
        participation: P,
    ) -> Result<Self, PoolError> {
        let queue: LockFreeQueue<Task> = LockFreeQueue::try_with_config(queue_config, SystemAllocator)?;
        let number_of_threads: usize = if config.number_of_threads == 0 {
            num_cpus::get().max(1)
        } else {
            config.number_of_threads
        };
        let id: usize = Context::global().next_pool_id();

        let mut pool: Self = Self {
            shared: Arc::new(Shared {
                queue,
                queued: AtomicWord::new(0),
                running: AtomicWord::new(0),
                unfinished: AtomicWord::new(0),
                shutdown: AtomicBool::new(false),
                abort: AtomicBool::new(false),
                failures: LockFreeStack::new(),
                idle,
            }),
            workers: Vec::with_capacity(number_of_threads),
            participation,
            max_tasks_in_queue: config.max_tasks_in_queue,
            id,
        };

        for index in 0..number_of_threads {
            let shared: Arc<Shared<I>> = pool.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{id}-{index}", config.thread_name_prefix))
                .spawn(move || worker_loop(shared, index));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                // dropping the pool stops the workers spawned so far
                Err(io_error) => return Err(PoolError::Spawn(io_error.to_string())),
            }
        }
        debug!("Thread pool {id} started with {number_of_threads} workers");
        Ok(pool)
    }

    /// Queue `f` to run on a worker.
    ///
    /// If the queue is bounded and full, this waits for room. A participating submitter runs
    /// queued tasks itself while it waits.
    pub fn add_task<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::new(f), true)
    }

    /// Queue a task whose `Err` return is reported by [ThreadPool::complete_all_tasks].
    pub fn add_fallible_task<F, E>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Display,
    {
        self.submit(Task::fallible(f), true)
    }

    /// Like [ThreadPool::add_task], but fails with [PoolError::QueueFull] instead of waiting.
    pub fn try_add_task<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::new(f), false)
    }

    fn submit(&self, task: Task, wait_for_room: bool) -> Result<(), PoolError> {
        self.reserve_queue_slot(wait_for_room)?;
        self.shared.unfinished.increment();
        if let Err(alloc_error) = self.shared.queue.push(task) {
            self.shared.queued.decrement();
            self.shared.finish_one();
            return Err(PoolError::Alloc(alloc_error));
        }
        self.shared.idle.work_available();
        Ok(())
    }

    /// Count a task into `queued`, respecting `max_tasks_in_queue`.
    fn reserve_queue_slot(&self, wait_for_room: bool) -> Result<(), PoolError> {
        let backoff: Backoff = Backoff::new();
        let mut warned: bool = false;
        let mut queued: usize = self.shared.queued.load();
        loop {
            if self.max_tasks_in_queue == 0 || queued < self.max_tasks_in_queue {
                match self.shared.queued.compare_exchange(queued, queued + 1) {
                    Ok(_) => return Ok(()),
                    Err(actual) => {
                        queued = actual;
                        continue;
                    }
                }
            }

            if !wait_for_room {
                return Err(PoolError::QueueFull {
                    max_tasks_in_queue: self.max_tasks_in_queue,
                });
            }
            if !warned {
                warn!(
                    "Task queue of pool {} is full ({} tasks); waiting for room",
                    self.id, self.max_tasks_in_queue
                );
                warned = true;
            }
            if !(self.participation.helps_while_waiting() && self.shared.run_one(None)) {
                backoff.snooze();
            }
            queued = self.shared.queued.load();
        }
    }

    /// Wait until every accepted task has finished, then report failures collected since the
    /// last call.
    ///
    /// Each failure is reported exactly once, as [PoolError::TasksFailed].
    pub fn complete_all_tasks(&self) -> Result<(), PoolError> {
        self.wait_for_completion(None)
    }

    /// Like [ThreadPool::complete_all_tasks], but gives up with [PoolError::Timeout] after
    /// `timeout`. Failures are kept for a later call in that case.
    pub fn complete_all_tasks_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
        self.wait_for_completion(Some(Instant::now() + timeout))
    }

    #[instrument(level = "trace", skip(self), fields(pool = self.id))]
    fn wait_for_completion(&self, deadline: Option<Instant>) -> Result<(), PoolError> {
        let shared: &Shared<I> = &self.shared;
        let helps: bool = self.participation.helps_while_waiting();
        let before_deadline = || deadline.map_or(true, |deadline| Instant::now() < deadline);
        loop {
            if helps {
                while before_deadline() && shared.run_one(None) {}
            }
            if shared.unfinished.load() == 0 {
                return self.take_failures();
            }
            if !before_deadline() {
                return Err(PoolError::Timeout);
            }
            // a participating waiter also wakes for new work, and runs it on the next pass
            let woken: bool = shared.idle.wait_for_completion(
                &|| shared.unfinished.load() == 0 || (helps && shared.queued.load() > 0),
                deadline,
            );
            if !woken {
                return Err(PoolError::Timeout);
            }
        }
    }

    fn take_failures(&self) -> Result<(), PoolError> {
        let mut failures: Vec<TaskFailure> = self.shared.failures.drain();
        if failures.is_empty() {
            return Ok(());
        }
        // the stack hands them back newest first
        failures.reverse();
        Err(PoolError::TasksFailed(failures))
    }

    /// Discard every queued task that has not started yet, and return how many there were.
    pub fn clear_queue(&self) -> usize {
        let mut cleared: usize = 0;
        while let Some(task) = self.shared.queue.pop() {
            drop(task);
            self.shared.queued.decrement();
            self.shared.finish_one();
            cleared += 1;
        }
        if cleared > 0 {
            debug!("Cleared {cleared} queued tasks from pool {}", self.id);
        }
        cleared
    }

    pub fn number_of_threads(&self) -> usize {
        self.workers.len()
    }

    /// Tasks waiting in the queue. Only exact while nothing is being submitted or popped.
    pub fn queued_tasks(&self) -> usize {
        self.shared.queued.load()
    }

    /// Tasks currently running.
    pub fn running_tasks(&self) -> usize {
        self.shared.running.load()
    }

    /// Finish every accepted task, then stop and join the workers.
    pub fn shutdown(self) -> Result<(), PoolError> {
        self.complete_all_tasks()
    }

    fn stop_workers(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.idle.shutdown();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("A worker of pool {} panicked outside of a task", self.id);
            }
        }
        debug!("Thread pool {} stopped", self.id);
    }
}

impl<I: IdlePolicy, P: ParticipationPolicy> Drop for ThreadPool<I, P> {
    fn drop(&mut self) {
        let queued: usize = self.queued_tasks();
        if queued > 0 {
            error!(
                "Thread pool {} dropped with {queued} tasks still queued; discarding them. \
                 Call complete_all_tasks or clear_queue first.",
                self.id
            );
            self.shared.abort.store(true, Ordering::Release);
        }
        self.stop_workers();
        self.clear_queue();

        let unreported: usize = self.shared.failures.len();
        if unreported > 0 {
            warn!("Thread pool {} dropped with {unreported} unreported task failures", self.id);
        }
    }
}

impl<I: IdlePolicy, P: ParticipationPolicy> Debug for ThreadPool<I, P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.id)
            .field("number_of_threads", &self.number_of_threads())
            .field("queued_tasks", &self.queued_tasks())
            .field("running_tasks", &self.running_tasks())
            .field("max_tasks_in_queue", &self.max_tasks_in_queue)
            .finish()
    }
}

#[cfg(all(test, feature = "std", not(feature = "shuttle"), not(loom)))]
mod tests {
    use crate::atomic::AtomicOps;
    use crate::err::{AllocError, PoolError, TaskError, TaskFailure};
    use crate::freelist::FreeListConfig;
    use crate::pool::{Delegate, IdlePolicy, Participate, Shared, Sleep, Spin, ThreadPool, ThreadPoolConfig};
    use crate::test_support::CapturedEvents;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};
    use test_log::test;
    use tracing::Level;

    fn config(number_of_threads: usize, max_tasks_in_queue: usize) -> ThreadPoolConfig {
        ThreadPoolConfig {
            number_of_threads,
            max_tasks_in_queue,
            ..ThreadPoolConfig::default()
        }
    }

    /// Queue a task that holds its worker until `gate` is opened, and wait for it to start.
    fn block_worker<I, P>(pool: &ThreadPool<I, P>, gate: &Arc<AtomicBool>)
    where
        I: IdlePolicy,
        P: crate::pool::ParticipationPolicy,
    {
        let gate: Arc<AtomicBool> = gate.clone();
        pool.add_task(move || {
            while !gate.load(Ordering::Acquire) {
                thread::yield_now();
            }
        })
        .unwrap();
        while pool.running_tasks() == 0 {
            thread::yield_now();
        }
    }

    #[test]
    fn test_every_task_runs_exactly_once() {
        const TASKS: usize = 10_000;
        let pool: ThreadPool = ThreadPool::new(config(4, 0)).unwrap();
        assert_eq!(pool.number_of_threads(), 4);

        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        for _ in 0..TASKS {
            let counter: Arc<AtomicUsize> = counter.clone();
            pool.add_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        pool.complete_all_tasks().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), TASKS);
        assert_eq!(pool.queued_tasks(), 0);
        assert_eq!(pool.running_tasks(), 0);
        pool.shutdown().unwrap();
    }

    #[test]
    fn test_failures_are_reported_once_and_do_not_stop_workers() {
        let pool: ThreadPool = ThreadPool::new(config(2, 0)).unwrap();
        let counter: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let counter: Arc<AtomicUsize> = counter.clone();
            pool.add_fallible_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                if i == 42 {
                    Err("bad input")
                } else {
                    Ok(())
                }
            })
            .unwrap();
        }
        pool.add_task(|| panic!("worker should survive this")).unwrap();

        let failures: Vec<TaskFailure> = match pool.complete_all_tasks() {
            Err(PoolError::TasksFailed(failures)) => failures,
            other => panic!("expected task failures, got {other:?}"),
        };
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .any(|failure| failure.error == TaskError::Failed("bad input".to_string())));
        assert!(failures.iter().any(|failure| failure.error
            == TaskError::Panicked("worker should survive this".to_string())));
        assert!(failures.iter().all(|failure| failure.worker.is_some()));
        assert_eq!(counter.load(Ordering::Relaxed), 100);

        // already reported, and the workers are still alive
        pool.add_task(|| {}).unwrap();
        assert_eq!(pool.complete_all_tasks(), Ok(()));
    }

    #[test]
    fn test_try_add_task_reports_a_full_queue() {
        let pool: ThreadPool = ThreadPool::new(config(1, 2)).unwrap();
        let gate: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        block_worker(&pool, &gate);

        pool.try_add_task(|| {}).unwrap();
        pool.try_add_task(|| {}).unwrap();
        assert_eq!(pool.queued_tasks(), 2);
        assert_eq!(
            pool.try_add_task(|| {}),
            Err(PoolError::QueueFull { max_tasks_in_queue: 2 })
        );

        gate.store(true, Ordering::Release);
        pool.complete_all_tasks().unwrap();
        pool.try_add_task(|| {}).unwrap();
        pool.complete_all_tasks().unwrap();
    }

    #[test]
    fn test_timeout_keeps_failures_for_later() {
        let pool: ThreadPool = ThreadPool::new(config(1, 0)).unwrap();
        pool.add_fallible_task(|| Err::<(), _>("first")).unwrap();
        let gate: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        block_worker(&pool, &gate);

        assert_eq!(
            pool.complete_all_tasks_timeout(Duration::from_millis(20)),
            Err(PoolError::Timeout)
        );
        gate.store(true, Ordering::Release);
        let error: PoolError = pool.complete_all_tasks().unwrap_err();
        assert_eq!(error.failures().len(), 1);
        assert_eq!(pool.complete_all_tasks_timeout(Duration::from_secs(10)), Ok(()));
    }

    #[test]
    fn test_clear_queue_discards_unstarted_tasks() {
        let pool: ThreadPool = ThreadPool::new(config(1, 0)).unwrap();
        let gate: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        block_worker(&pool, &gate);

        let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let ran: Arc<AtomicUsize> = ran.clone();
            pool.add_task(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        assert_eq!(pool.clear_queue(), 5);
        assert_eq!(pool.queued_tasks(), 0);

        gate.store(true, Ordering::Release);
        pool.complete_all_tasks().unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_participating_submitter_helps_with_a_full_queue() {
        let pool: ThreadPool<Spin, Participate> =
            ThreadPool::with_policies(config(1, 1), Spin, Participate).unwrap();
        let gate: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        block_worker(&pool, &gate);

        let ran_on: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran_on: Arc<AtomicUsize> = ran_on.clone();
            pool.add_fallible_task(move || {
                ran_on.fetch_add(1, Ordering::Relaxed);
                Err::<(), _>("helped")
            })
            .unwrap();
        }
        // the only worker is blocked, so the submitter ran all but the last queued task itself
        assert_eq!(ran_on.load(Ordering::Relaxed), 2);

        // waiting runs the last one too, then times out on the blocked worker
        assert_eq!(
            pool.complete_all_tasks_timeout(Duration::from_millis(20)),
            Err(PoolError::Timeout)
        );
        assert_eq!(ran_on.load(Ordering::Relaxed), 3);

        gate.store(true, Ordering::Release);
        let error: PoolError = pool.complete_all_tasks().unwrap_err();
        assert_eq!(error.failures().len(), 3);
        assert!(error.failures().iter().all(|failure| failure.worker.is_none()));
    }

    #[test]
    fn test_drop_discards_queued_tasks() {
        let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        let gate: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        let pool: ThreadPool = ThreadPool::new(config(1, 0)).unwrap();
        block_worker(&pool, &gate);
        for _ in 0..3 {
            let ran: Arc<AtomicUsize> = ran.clone();
            pool.add_task(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }
        assert_eq!(pool.queued_tasks(), 3);
        let shared: Arc<Shared<Sleep>> = pool.shared.clone();

        let events: CapturedEvents = CapturedEvents::default();
        let dropper: thread::JoinHandle<()> = {
            let events: CapturedEvents = events.clone();
            thread::spawn(move || events.capture(move || drop(pool)))
        };
        // the worker is released only once the drop has told it to stop after its current task
        while !shared.abort.load(Ordering::Acquire) {
            thread::yield_now();
        }
        gate.store(true, Ordering::Release);
        dropper.join().unwrap();

        assert_eq!(ran.load(Ordering::Relaxed), 0);
        assert_eq!(shared.queued.load(), 0);
        assert_eq!(shared.unfinished.load(), 0);
        let errors: Vec<String> = events.messages_at(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("dropped with 3 tasks still queued"), "{}", errors[0]);
    }

    /// One worker is stuck, and a task is queued after another thread started waiting. The
    /// waiting thread has to run it.
    fn waiter_runs_tasks_queued_while_it_waits<I: IdlePolicy>(idle: I) {
        let pool: ThreadPool<I, Participate> = ThreadPool::with_policies(config(1, 0), idle, Participate).unwrap();
        let gate: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
        block_worker(&pool, &gate);

        let ran: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
        thread::scope(|scope| {
            let waiter = scope.spawn(|| pool.complete_all_tasks_timeout(Duration::from_secs(10)));
            thread::sleep(Duration::from_millis(50));

            let task_ran: Arc<AtomicUsize> = ran.clone();
            pool.add_task(move || {
                task_ran.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
            let deadline: Instant = Instant::now() + Duration::from_secs(5);
            while ran.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
                thread::yield_now();
            }
            let ran_before_gate: usize = ran.load(Ordering::Relaxed);
            gate.store(true, Ordering::Release);

            assert_eq!(ran_before_gate, 1);
            assert_eq!(waiter.join().unwrap(), Ok(()));
        });
        assert_eq!(pool.queued_tasks(), 0);
    }

    #[test]
    fn test_spinning_waiter_runs_tasks_queued_while_it_waits() {
        waiter_runs_tasks_queued_while_it_waits(Spin);
    }

    #[test]
    fn test_sleeping_waiter_runs_tasks_queued_while_it_waits() {
        waiter_runs_tasks_queued_while_it_waits(Sleep::new());
    }

    #[test]
    fn test_queue_allocation_failure_is_returned() {
        let queue_config: FreeListConfig = FreeListConfig {
            max_blocks: 0,
            ..FreeListConfig::default()
        };
        match ThreadPool::with_queue_config(config(1, 0), queue_config, Spin, Delegate) {
            Err(PoolError::Alloc(AllocError::Exhausted { max_blocks: 0 })) => {}
            other => panic!("expected the queue allocation to fail, got {other:?}"),
        }
    }
}
