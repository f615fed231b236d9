use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

use crate::raw::RawLock;

/// Mutual exclusion over a [`RawLock`].
pub struct Mutex<T, R> {
    raw: R,
    value: UnsafeCell<T>,
}

// Safety: the raw lock serializes every access to `value`.
unsafe impl<T: Send, R: RawLock + Sync> Sync for Mutex<T, R> {}

impl<T, R: RawLock> Mutex<T, R> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            raw: R::UNLOCKED,
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.lock();
        MutexGuard { mutex: self }
    }

    /// The guard, unless someone else holds the lock.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        self.raw.try_lock().then(|| MutexGuard { mutex: self })
    }

    /// Whether the lock is held by anyone. Stale by the time it returns;
    /// use it to assert that the caller's own lock is held.
    #[must_use]
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

impl<T: fmt::Debug, R: RawLock> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => d.field("value", &*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// Holds the lock until dropped.
pub struct MutexGuard<'a, T, R: RawLock> {
    mutex: &'a Mutex<T, R>,
}

impl<T, R: RawLock> Deref for MutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, R: RawLock> DerefMut for MutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T, R: RawLock> Drop for MutexGuard<'_, T, R> {
    fn drop(&mut self) {
        unsafe { self.mutex.raw.unlock() }
    }
}
