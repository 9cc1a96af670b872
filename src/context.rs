//! Process-wide state shared by everything in this crate.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use once_cell::sync::OnceCell;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

static CONTEXT: OnceCell<Context> = OnceCell::new();

/// The single process-wide context.
///
/// It owns the counters and the lock which genuinely have to be global: the id handed to each
/// [crate::ThreadPool] for naming its workers, and the lock behind every
/// [crate::atomic::fallback::LockedWord]. These are plain std primitives rather than the ones
/// selected by `sync`, since they outlive any single loom or shuttle execution.
#[derive(Debug)]
pub struct Context {
    pools_created: AtomicUsize,
    fallback_lock: Mutex<()>,
    fallback_in_use: AtomicBool,
}

impl Context {
    fn new() -> Self {
        debug!("Initializing process-wide context");
        Self {
            pools_created: AtomicUsize::new(0),
            fallback_lock: Mutex::new(()),
            fallback_in_use: AtomicBool::new(false),
        }
    }

    /// The process-wide context, initialized by the first call.
    pub fn global() -> &'static Context {
        CONTEXT.get_or_init(Context::new)
    }

    /// Hand out the next pool id. Ids start at 0 and are never reused.
    pub(crate) fn next_pool_id(&self) -> usize {
        self.pools_created.fetch_add(1, Ordering::Relaxed)
    }

    /// The number of thread pools created so far in this process.
    pub fn pools_created(&self) -> usize {
        self.pools_created.load(Ordering::Relaxed)
    }

    /// Whether any [crate::atomic::fallback::LockedWord] has been created in this process.
    pub fn fallback_in_use(&self) -> bool {
        self.fallback_in_use.load(Ordering::Relaxed)
    }

    pub(crate) fn lock_fallback(&self) -> MutexGuard<'_, ()> {
        // the guarded data is `()`, so a poisoned lock has nothing left half-updated
        self.fallback_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn warn_fallback_in_use(&self, type_name: &str) {
        if !self.fallback_in_use.swap(true, Ordering::Relaxed) {
            warn!(
                "No native atomic for {type_name}: falling back to a single global lock. \
                 Expect severe slowdowns under contention."
            );
        }
    }
}
