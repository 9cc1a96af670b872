//! A writer-preferring reader/writer spinlock.
//!
//! The lock is two counters. `available_reader_slots` starts at `max_readers`: each reader takes
//! one slot and a writer takes all of them at once by swapping `max_readers` for 0.
//! `writers_waiting` counts writers that want the lock or hold it. While it is non-zero, new
//! readers hold back, so a writer waits for at most the readers already inside.
//!
//! Waiting is busy: a few rounds of spinning, then yielding the CPU. Keep critical sections
//! short.

use crate::atomic::{AtomicOps, AtomicWord};
use crate::backoff::Backoff;
use crate::sync::{AtomicBool, Ordering};
use core::cell::UnsafeCell;
use core::fmt::{Debug, Formatter};
use core::ops::{Deref, DerefMut};
use tracing::error;

/// Enough readers that the limit never binds in practice.
pub const DEFAULT_MAX_READERS: usize = i32::MAX as usize;

/// The lock without any data attached.
///
/// Unlocking a lock that is not held in that mode is reported and otherwise ignored. In debug
/// builds it also panics.
pub struct RawRwSpinLock {
    available_reader_slots: AtomicWord<isize>,
    writers_waiting: AtomicWord<isize>,
    /// Set while a writer holds the lock. A full house of readers also leaves no slots, so the
    /// slot count alone cannot tell the two apart.
    writer_active: AtomicBool,
    max_readers: isize,
}

impl RawRwSpinLock {
    /// A lock admitting up to `max_readers` concurrent readers. Zero is treated as one.
    pub fn new(max_readers: usize) -> Self {
        let max_readers: isize = max_readers.clamp(1, isize::MAX as usize) as isize;
        Self {
            available_reader_slots: AtomicWord::new(max_readers),
            writers_waiting: AtomicWord::new(0),
            writer_active: AtomicBool::new(false),
            max_readers,
        }
    }

    pub fn lock_read(&self) {
        let backoff: Backoff = Backoff::new();
        loop {
            while self.writers_waiting.load() > 0 {
                backoff.snooze();
            }
            let slots: isize = self.available_reader_slots.load();
            if slots > 0 && self.available_reader_slots.compare_and_swap(slots, slots - 1) {
                return;
            }
            backoff.snooze();
        }
    }

    /// Take a read slot if no writer is waiting and a slot is free.
    pub fn try_lock_read(&self) -> bool {
        if self.writers_waiting.load() > 0 {
            return false;
        }
        let mut slots: isize = self.available_reader_slots.load();
        while slots > 0 {
            match self.available_reader_slots.compare_exchange(slots, slots - 1) {
                Ok(_) => return true,
                Err(actual) => slots = actual,
            }
        }
        false
    }

    pub fn unlock_read(&self) {
        let mut slots: isize = self.available_reader_slots.load();
        loop {
            if slots >= self.max_readers || self.writer_active.load(Ordering::Acquire) {
                error!("unlock_read called on a lock with no readers");
                debug_assert!(false, "unlock_read called on a lock with no readers");
                return;
            }
            match self.available_reader_slots.compare_exchange(slots, slots + 1) {
                Ok(_) => return,
                Err(actual) => slots = actual,
            }
        }
    }

    pub fn lock_write(&self) {
        self.writers_waiting.increment();
        let backoff: Backoff = Backoff::new();
        while !self.available_reader_slots.compare_and_swap(self.max_readers, 0) {
            backoff.snooze();
        }
        self.writer_active.store(true, Ordering::Release);
    }

    /// Take the lock for writing if no reader or writer holds it.
    pub fn try_lock_write(&self) -> bool {
        self.writers_waiting.increment();
        if self.available_reader_slots.compare_and_swap(self.max_readers, 0) {
            self.writer_active.store(true, Ordering::Release);
            true
        } else {
            self.writers_waiting.decrement();
            false
        }
    }

    pub fn unlock_write(&self) {
        if !self.writer_active.swap(false, Ordering::AcqRel) {
            error!("unlock_write called on a lock no writer holds");
            debug_assert!(false, "unlock_write called on a lock no writer holds");
            return;
        }
        if !self.available_reader_slots.compare_and_swap(0, self.max_readers) {
            error!("Reader slots changed while a writer held the lock");
            debug_assert!(false, "reader slots changed while a writer held the lock");
        }
        self.writers_waiting.decrement();
    }

    pub fn max_readers(&self) -> usize {
        self.max_readers as usize
    }

    /// The number of readers holding the lock at the moment it was observed.
    pub fn readers(&self) -> usize {
        if self.writer_active.load(Ordering::Acquire) {
            return 0;
        }
        (self.max_readers - self.available_reader_slots.load()).max(0) as usize
    }

    pub fn is_locked_write(&self) -> bool {
        self.writer_active.load(Ordering::Acquire)
    }

    fn is_locked(&self) -> bool {
        self.is_locked_write() || self.available_reader_slots.load() != self.max_readers
    }
}

impl Default for RawRwSpinLock {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_READERS)
    }
}

impl Drop for RawRwSpinLock {
    fn drop(&mut self) {
        if self.is_locked() {
            error!(
                "RwSpinLock dropped while held ({} readers, writer: {})",
                self.readers(),
                self.is_locked_write()
            );
        }
    }
}

impl Debug for RawRwSpinLock {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawRwSpinLock")
            .field("readers", &self.readers())
            .field("writer", &self.is_locked_write())
            .field("writers_waiting", &self.writers_waiting.load())
            .field("max_readers", &self.max_readers)
            .finish()
    }
}

/// A [RawRwSpinLock] guarding a `T`.
pub struct RwSpinLock<T> {
    raw: RawRwSpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub fn new(value: T) -> Self {
        Self::with_max_readers(value, DEFAULT_MAX_READERS)
    }

    pub fn with_max_readers(value: T, max_readers: usize) -> Self {
        Self {
            raw: RawRwSpinLock::new(max_readers),
            value: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        self.raw.lock_read();
        RwSpinReadGuard { lock: self }
    }

    pub fn try_read(&self) -> Option<RwSpinReadGuard<'_, T>> {
        if self.raw.try_lock_read() {
            Some(RwSpinReadGuard { lock: self })
        } else {
            None
        }
    }

    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        self.raw.lock_write();
        RwSpinWriteGuard { lock: self }
    }

    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        if self.raw.try_lock_write() {
            Some(RwSpinWriteGuard { lock: self })
        } else {
            None
        }
    }

    /// Mutable access without locking, since the borrow already proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }

    pub fn raw(&self) -> &RawRwSpinLock {
        &self.raw
    }
}

impl<T: Default> Default for RwSpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Debug> Debug for RwSpinLock<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let mut debug = f.debug_struct("RwSpinLock");
        match self.try_read() {
            Some(guard) => debug.field("value", &&*guard),
            None => debug.field("value", &format_args!("<locked>")),
        };
        debug.finish()
    }
}

pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> Deref for RwSpinReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding a read slot excludes every writer.
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> Drop for RwSpinReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_read();
    }
}

pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<'a, T> Deref for RwSpinWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the writer holds every slot.
        unsafe { &*self.lock.value.get() }
    }
}

impl<'a, T> DerefMut for RwSpinWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the writer holds every slot.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<'a, T> Drop for RwSpinWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock_write();
    }
}
