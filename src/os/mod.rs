// SPDX-License-Identifier: MPL-2.0

//! OS-specific or OS-dependent APIs.
//!
//! Everything the engine needs from its host environment is funneled
//! through this module, so the rest of the crate is written against a
//! small, stable surface: locks without poisoning, a condition variable,
//! and thread spawn/join.

use core::fmt;

pub use std::{
    boxed::Box,
    collections::BTreeMap,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};

pub use hashbrown::{HashMap, HashSet};

/// A mutual exclusion lock.
///
/// Unlike `std::sync::Mutex`, lock poisoning is not surfaced: a panic
/// while holding the lock does not render the data unreachable. The
/// engine's workers never unwind across a lock in normal operation.
pub struct Mutex<T: ?Sized> {
    inner: std::sync::Mutex<T>,
}

pub type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;

impl<T> Mutex<T> {
    /// Creates a new mutex protecting the given data.
    pub const fn new(data: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock and gives the caller access to the data protected by it.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex").finish_non_exhaustive()
    }
}

/// A readers-writer lock with the same non-poisoning policy as [`Mutex`].
pub struct RwLock<T: ?Sized> {
    inner: std::sync::RwLock<T>,
}

pub type RwLockReadGuard<'a, T> = std::sync::RwLockReadGuard<'a, T>;
pub type RwLockWriteGuard<'a, T> = std::sync::RwLockWriteGuard<'a, T>;

impl<T> RwLock<T> {
    /// Creates a new readers-writer lock protecting the given data.
    pub const fn new(data: T) -> Self {
        Self {
            inner: std::sync::RwLock::new(data),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires the lock for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquires the lock for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A `Condvar` (Condition Variable) is a synchronization primitive that can
/// block threads until a certain condition becomes true.
pub struct Condvar {
    inner: std::sync::Condvar,
}

impl Condvar {
    /// Creates a new condition variable.
    pub const fn new() -> Self {
        Self {
            inner: std::sync::Condvar::new(),
        }
    }

    /// Atomically releases the given guard, blocking the current thread
    /// until the condition variable is notified, after which the mutex
    /// will be reacquired.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.inner
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Like [`Condvar::wait`], but gives up after `timeout`.
    ///
    /// Returns the reacquired guard and whether the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: core::time::Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        let (guard, result) = self
            .inner
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (guard, result.timed_out())
    }

    /// Wakes up one blocked thread waiting on this condition variable.
    pub fn notify_one(&self) {
        self.inner.notify_one();
    }

    /// Wakes up all blocked threads waiting on this condition variable.
    pub fn notify_all(&self) {
        self.inner.notify_all();
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a new thread with the given name, returning a `JoinHandle` for it.
pub fn spawn<F>(name: String, f: F) -> JoinHandle
where
    F: FnOnce() + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(f)
        .expect("spawning a worker thread must not fail");
    JoinHandle { inner: handle }
}

/// An owned permission to join on a thread (block on its termination).
pub struct JoinHandle {
    inner: std::thread::JoinHandle<()>,
}

impl JoinHandle {
    /// Waits for the associated thread to finish.
    pub fn join(self) {
        let _ = self.inner.join();
    }
}

impl fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").finish_non_exhaustive()
    }
}
