//! What pool threads do when there is nothing to run, and whether submitters lend a hand.

use crate::backoff::Backoff;
use crate::sync::{Condvar, Mutex};
use core::fmt::{Debug, Formatter};
use std::sync::{LockResult, PoisonError};
use std::time::Instant;
use tracing::trace;

/// How idle workers and waiting submitters pass the time.
///
/// The pool calls [IdlePolicy::work_available] after queueing a task, which must wake both
/// idle workers and threads in [IdlePolicy::wait_for_completion]. It calls [IdlePolicy::completed]
/// when the last unfinished task finishes, and [IdlePolicy::shutdown] when it stops. Waiters
/// re-check their condition after every wake-up, so spurious wake-ups are harmless.
pub trait IdlePolicy: Send + Sync + 'static {
    /// Return once `ready` holds. Called by workers that found the queue empty.
    fn wait_for_work(&self, ready: &dyn Fn() -> bool);

    fn work_available(&self);

    /// Return `true` once `done` holds, or `false` if `deadline` passes first.
    fn wait_for_completion(&self, done: &dyn Fn() -> bool, deadline: Option<Instant>) -> bool;

    fn completed(&self);

    fn shutdown(&self);
}

/// Busy-wait. Lowest latency, but every idle worker keeps a core busy.
#[derive(Clone, Copy, Debug, Default)]
pub struct Spin;

impl IdlePolicy for Spin {
    fn wait_for_work(&self, ready: &dyn Fn() -> bool) {
        let backoff: Backoff = Backoff::new();
        while !ready() {
            backoff.snooze();
        }
    }

    fn work_available(&self) {}

    fn wait_for_completion(&self, done: &dyn Fn() -> bool, deadline: Option<Instant>) -> bool {
        let backoff: Backoff = Backoff::new();
        loop {
            if done() {
                return true;
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                return false;
            }
            backoff.snooze();
        }
    }

    fn completed(&self) {}

    fn shutdown(&self) {}
}

/// Sleep on a condition variable until woken by the pool.
///
/// Notifications are sent while holding the lock, so a waiter that just found its condition
/// false cannot miss them.
pub struct Sleep {
    lock: Mutex<()>,
    work: Condvar,
    done: Condvar,
}

impl Sleep {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            work: Condvar::new(),
            done: Condvar::new(),
        }
    }
}

impl Default for Sleep {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Sleep {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sleep").finish_non_exhaustive()
    }
}

impl IdlePolicy for Sleep {
    fn wait_for_work(&self, ready: &dyn Fn() -> bool) {
        let mut guard = recover(self.lock.lock());
        while !ready() {
            trace!("Sleeping until work arrives");
            guard = recover(self.work.wait(guard));
        }
    }

    fn work_available(&self) {
        let _guard = recover(self.lock.lock());
        self.work.notify_one();
        // participating waiters sleep on `done` and pick up queued work themselves
        self.done.notify_all();
    }

    fn wait_for_completion(&self, done: &dyn Fn() -> bool, deadline: Option<Instant>) -> bool {
        let mut guard = recover(self.lock.lock());
        loop {
            if done() {
                return true;
            }
            match deadline {
                None => guard = recover(self.done.wait(guard)),
                Some(deadline) => {
                    let now: Instant = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    guard = recover(self.done.wait_timeout(guard, deadline - now)).0;
                }
            }
        }
    }

    fn completed(&self) {
        let _guard = recover(self.lock.lock());
        self.done.notify_all();
    }

    fn shutdown(&self) {
        let _guard = recover(self.lock.lock());
        self.work.notify_all();
        self.done.notify_all();
    }
}

/// The mutex guards no data, so a panic while holding it leaves nothing half-updated.
fn recover<G>(result: LockResult<G>) -> G {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Whether a thread blocked in the pool runs queued tasks itself while it waits.
pub trait ParticipationPolicy: Send + Sync + 'static {
    fn helps_while_waiting(&self) -> bool;
}

/// Waiting submitters pop and run queued tasks on their own thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct Participate;

impl ParticipationPolicy for Participate {
    fn helps_while_waiting(&self) -> bool {
        true
    }
}

/// Waiting submitters leave all the work to the pool's workers.
#[derive(Clone, Copy, Debug, Default)]
pub struct Delegate;

impl ParticipationPolicy for Delegate {
    fn helps_while_waiting(&self) -> bool {
        false
    }
}
