use displaydoc::Display;

/// The free list could not hand out another block.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum AllocError {
    /// The backing allocator could not provide {size} bytes aligned to {align}.
    OutOfMemory { size: usize, align: usize },
    /// All {max_blocks} blocks this free list may hand out are already in use.
    Exhausted { max_blocks: usize },
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

/// The way a single task failed.
#[cfg(feature = "std")]
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum TaskError {
    /// The task panicked: {0}
    Panicked(String),
    /// The task returned an error: {0}
    Failed(String),
}

#[cfg(feature = "std")]
impl std::error::Error for TaskError {}

/// A task failure together with the worker which observed it.
///
/// `worker` is `None` when the task was run by a thread helping out inside
/// [crate::ThreadPool::complete_all_tasks] rather than by one of the pool's own workers.
#[cfg(feature = "std")]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskFailure {
    pub worker: Option<usize>,
    pub error: TaskError,
}

#[cfg(feature = "std")]
impl core::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.worker {
            Some(worker) => write!(f, "worker {worker}: {}", self.error),
            None => write!(f, "submitting thread: {}", self.error),
        }
    }
}

/// Any error surfaced by a [crate::ThreadPool].
#[cfg(feature = "std")]
#[derive(Debug, Display, Eq, PartialEq)]
pub enum PoolError {
    /// Could not allocate a queue node for the task: {0}
    Alloc(AllocError),
    /// The task queue already holds the configured maximum of {max_tasks_in_queue} tasks.
    QueueFull { max_tasks_in_queue: usize },
    /// One or more tasks failed since the last time failures were collected.
    TasksFailed(Vec<TaskFailure>),
    /// Queued and running tasks did not finish before the deadline.
    Timeout,
    /// Could not spawn a worker thread: {0}
    Spawn(String),
}

#[cfg(feature = "std")]
impl std::error::Error for PoolError {}

#[cfg(feature = "std")]
impl From<AllocError> for PoolError {
    fn from(alloc_error: AllocError) -> Self {
        PoolError::Alloc(alloc_error)
    }
}

#[cfg(feature = "std")]
impl PoolError {
    /// The task failures carried by this error, if any.
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            PoolError::TasksFailed(failures) => failures,
            _ => &[],
        }
    }
}
