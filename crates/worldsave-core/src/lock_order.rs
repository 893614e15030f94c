//! Lock ordering + debug-only deadlock prevention utilities.
//!
//! The storage layer nests a few long-lived locks: a save function takes a
//! store's record read lock before the directory cache, and a save queue's
//! timer-handle lock sits between the two. Store mutations release the record
//! lock before asking for a save, and the scheduler's own state lock is a plain
//! `Mutex` outside this hierarchy. This module fixes the order in one place.
//!
//! Rule (strict):
//! - When a thread already holds any lock(s), it may only acquire locks with a
//!   strictly higher `LockLevel::rank()`.
//!
//! Checks compile to no-ops outside `debug_assertions`. Never hold these locks
//! across blocking IO.

#![forbid(unsafe_code)]

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Global lock hierarchy.
///
/// Lower rank must be acquired before higher rank when locks are nested.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockLevel {
    /// In-memory record map of one entity store.
    StorageRecords,
    /// Join handle of a save queue's timer thread.
    StorageSaveQueueTimerHandle,
    /// Directory existence cache.
    StorageDirCache,
}

impl LockLevel {
    /// Total order rank. Must be unique per variant.
    #[must_use]
    pub const fn rank(self) -> u16 {
        match self {
            Self::StorageRecords => 10,
            Self::StorageSaveQueueTimerHandle => 20,
            Self::StorageDirCache => 30,
        }
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}@{}", self.rank())
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD_LOCKS: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

#[inline]
fn check_before_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let held = held.borrow();
        let Some(&last) = held.last() else {
            return;
        };
        assert!(
            level.rank() > last.rank(),
            "lock order violation: attempting to acquire {} while holding {}. held={:?}",
            level,
            last,
            held.as_slice()
        );
    });
}

#[inline]
fn did_acquire(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| held.borrow_mut().push(level));
}

#[inline]
fn did_release(level: LockLevel) {
    #[cfg(debug_assertions)]
    HELD_LOCKS.with(|held| {
        let mut held = held.borrow_mut();
        let last = held.pop();
        assert!(
            last == Some(level),
            "lock tracking corrupted: expected to release {}, popped={:?}, held={:?}",
            level,
            last,
            held.as_slice()
        );
    });
}

/// Mutex wrapper that enforces the global lock hierarchy in debug builds.
#[derive(Debug)]
pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedMutexGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        did_acquire(self.level);
        OrderedMutexGuard {
            level: self.level,
            guard,
        }
    }

    pub fn try_lock(&self) -> Option<OrderedMutexGuard<'_, T>> {
        check_before_acquire(self.level);
        let guard = self.inner.try_lock().ok()?;
        did_acquire(self.level);
        Some(OrderedMutexGuard {
            level: self.level,
            guard,
        })
    }
}

pub struct OrderedMutexGuard<'a, T> {
    level: LockLevel,
    guard: MutexGuard<'a, T>,
}

impl<T> Drop for OrderedMutexGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for OrderedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// `RwLock` wrapper that enforces the global lock hierarchy in debug builds.
#[derive(Debug)]
pub struct OrderedRwLock<T> {
    level: LockLevel,
    inner: RwLock<T>,
}

impl<T> OrderedRwLock<T> {
    #[must_use]
    pub const fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: RwLock::new(value),
        }
    }

    pub fn read(&self) -> OrderedRwLockReadGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        did_acquire(self.level);
        OrderedRwLockReadGuard {
            level: self.level,
            guard,
        }
    }

    pub fn write(&self) -> OrderedRwLockWriteGuard<'_, T> {
        check_before_acquire(self.level);
        let guard = self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        did_acquire(self.level);
        OrderedRwLockWriteGuard {
            level: self.level,
            guard,
        }
    }
}

pub struct OrderedRwLockReadGuard<'a, T> {
    level: LockLevel,
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Drop for OrderedRwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedRwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

pub struct OrderedRwLockWriteGuard<'a, T> {
    level: LockLevel,
    guard: RwLockWriteGuard<'a, T>,
}

impl<T> Drop for OrderedRwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        did_release(self.level);
    }
}

impl<T> Deref for OrderedRwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for OrderedRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn ordered_mutex_allows_increasing_order() {
        let records = OrderedRwLock::new(LockLevel::StorageRecords, ());
        let dir_cache = OrderedMutex::new(LockLevel::StorageDirCache, ());

        let _records = records.read();
        let _cache = dir_cache.lock();
    }

    #[test]
    #[should_panic(expected = "lock order violation")]
    fn ordered_mutex_panics_on_out_of_order() {
        let dir_cache = OrderedMutex::new(LockLevel::StorageDirCache, ());
        let records = OrderedRwLock::new(LockLevel::StorageRecords, ());

        let _cache = dir_cache.lock();
        let _records = records.write();
    }

    #[test]
    fn release_restores_empty_stack() {
        let dir_cache = OrderedMutex::new(LockLevel::StorageDirCache, 1_u32);
        {
            let mut guard = dir_cache.lock();
            *guard += 1;
        }
        // Re-acquiring a lower level is fine once everything was released.
        let records = OrderedRwLock::new(LockLevel::StorageRecords, ());
        let _records = records.read();
        assert_eq!(*dir_cache.try_lock().expect("uncontended"), 2);
    }

    #[test]
    fn stress_no_deadlock_under_contention_short() {
        let records = Arc::new(OrderedRwLock::new(LockLevel::StorageRecords, ()));
        let handle = Arc::new(OrderedMutex::new(LockLevel::StorageSaveQueueTimerHandle, ()));
        let dir_cache = Arc::new(OrderedMutex::new(LockLevel::StorageDirCache, ()));

        let start = Instant::now();
        let run_for = Duration::from_millis(100);

        let handles = (0..32)
            .map(|_| {
                let records = Arc::clone(&records);
                let handle = Arc::clone(&handle);
                let dir_cache = Arc::clone(&dir_cache);
                thread::spawn(move || {
                    while start.elapsed() < run_for {
                        let _records = records.read();
                        let _handle = handle.lock();
                        let _cache = dir_cache.lock();
                    }
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.join().expect("thread panicked");
        }
    }
}
