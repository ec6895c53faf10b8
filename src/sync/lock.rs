//! Scope-bound mutual exclusion
//!
//! A [`LockHandle`] owns the value it protects. A [`LockControl`] wraps a
//! borrowed handle and acquires or releases it on request; whatever it holds
//! is released when the controller goes out of scope, including early `?`
//! returns and unwinding.
//!
//! Acquisition by the same controller is a no-op rather than a deadlock.
//! A second controller on a held handle blocks in [`LockControl::lock`] and
//! fails in [`LockControl::try_lock`].

use parking_lot::{Mutex, MutexGuard};
use std::time::Duration;

/// Reusable mutual exclusion handle around a value
#[derive(Debug, Default)]
pub struct LockHandle<T: ?Sized> {
    inner: Mutex<T>,
}

impl<T> LockHandle<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> LockHandle<T> {
    /// Create a controller for this handle. The controller starts unlocked.
    pub fn control(&self) -> LockControl<'_, T> {
        LockControl::new(self)
    }

    /// Whether any controller currently holds the handle
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    /// Run `f` on the value, blocking until the handle is free
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Direct access when the handle is exclusively borrowed
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// Scope-bound controller for a [`LockHandle`]
pub struct LockControl<'a, T: ?Sized> {
    handle: &'a LockHandle<T>,
    guard: Option<MutexGuard<'a, T>>,
}

impl<'a, T: ?Sized> LockControl<'a, T> {
    pub fn new(handle: &'a LockHandle<T>) -> Self {
        Self {
            handle,
            guard: None,
        }
    }

    /// Request the lock without blocking.
    ///
    /// Returns `true` only if this call acquired the handle. Returns `false`
    /// if another controller holds it, or if this controller already does.
    pub fn try_lock(&mut self) -> bool {
        if self.guard.is_some() {
            return false;
        }
        self.guard = self.handle.inner.try_lock();
        self.guard.is_some()
    }

    /// Like [`try_lock`](Self::try_lock) but waits up to `timeout`
    pub fn try_lock_for(&mut self, timeout: Duration) -> bool {
        if self.guard.is_some() {
            return false;
        }
        self.guard = self.handle.inner.try_lock_for(timeout);
        self.guard.is_some()
    }

    /// Block until the handle is acquired. No-op if already held here.
    pub fn lock(&mut self) {
        if self.guard.is_none() {
            self.guard = Some(self.handle.inner.lock());
        }
    }

    /// Release the handle. No-op if not held here.
    pub fn unlock(&mut self) {
        self.guard = None;
    }

    pub fn is_locked(&self) -> bool {
        self.guard.is_some()
    }

    /// Protected value, if this controller holds the lock
    pub fn get(&self) -> Option<&T> {
        self.guard.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.guard.as_deref_mut()
    }
}

impl<T: ?Sized> Drop for LockControl<'_, T> {
    fn drop(&mut self) {
        self.unlock();
    }
}
