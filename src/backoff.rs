// LICENSE NOTICE: Most of this code has been copied from the crossbeam repository with the MIT license.

use crate::sync::{spin_loop, yield_now};
use core::cell::Cell;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Exponential backoff for CAS retry loops and spin waits.
///
/// `spin` is meant for retrying a CAS which lost a race: the other party is making progress, so
/// staying on the CPU is cheapest. `snooze` is meant for waiting on another thread to release
/// something: after a few rounds of spinning it starts yielding the time slice instead.
#[derive(Debug)]
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    pub fn new() -> Self {
        Self { step: Cell::new(0) }
    }

    pub fn reset(&self) {
        self.step.set(0);
    }

    /// Spin for `2^step` iterations, capped at [SPIN_LIMIT].
    pub fn spin(&self) {
        let step: u32 = self.step.get();
        for _ in 0..1u32 << step.min(SPIN_LIMIT) {
            spin_loop();
        }
        if step <= SPIN_LIMIT {
            self.step.set(step + 1);
        }
    }

    /// Spin while the step is small, then yield the CPU between checks.
    pub fn snooze(&self) {
        let step: u32 = self.step.get();
        if step <= SPIN_LIMIT {
            for _ in 0..1u32 << step {
                spin_loop();
            }
        } else {
            yield_now();
        }
        if step <= YIELD_LIMIT {
            self.step.set(step + 1);
        }
    }

    /// Whether we have been waiting long enough that blocking on something would be better than
    /// continuing to snooze.
    pub fn is_completed(&self) -> bool {
        self.step.get() > YIELD_LIMIT
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
