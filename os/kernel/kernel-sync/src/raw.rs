//! Raw lock words without data.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A lock word that [`Mutex`](crate::Mutex) can be built on.
///
/// # Safety
/// `lock` and a successful `try_lock` must give exclusive ownership until
/// the matching `unlock`, with acquire/release ordering.
pub unsafe trait RawLock {
    /// The unlocked state.
    const UNLOCKED: Self;

    fn lock(&self);

    fn try_lock(&self) -> bool;

    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn unlock(&self);

    /// Racy snapshot; only meaningful in assertions.
    fn is_locked(&self) -> bool;
}

/// Test-and-test-and-set spin lock.
pub struct RawSpin(AtomicBool);

unsafe impl RawLock for RawSpin {
    const UNLOCKED: Self = Self(AtomicBool::new(false));

    #[inline]
    fn lock(&self) {
        while self.0.swap(true, Ordering::Acquire) {
            while self.0.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.0.load(Ordering::Relaxed) && !self.0.swap(true, Ordering::Acquire)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Ticket lock; waiters get the lock in arrival order.
pub struct RawTicket {
    next: AtomicU32,
    serving: AtomicU32,
}

unsafe impl RawLock for RawTicket {
    const UNLOCKED: Self = Self {
        next: AtomicU32::new(0),
        serving: AtomicU32::new(0),
    };

    #[inline]
    fn lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    fn try_lock(&self) -> bool {
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(
                serving,
                serving.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        // only the holder writes `serving`
        let current = self.serving.load(Ordering::Relaxed);
        self.serving.store(current.wrapping_add(1), Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.serving.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise<R: RawLock>() {
        let raw = R::UNLOCKED;
        assert!(!raw.is_locked());
        raw.lock();
        assert!(raw.is_locked());
        assert!(!raw.try_lock());
        unsafe { raw.unlock() };
        assert!(raw.try_lock());
        unsafe { raw.unlock() };
        assert!(!raw.is_locked());
    }

    #[test]
    fn spin() {
        exercise::<RawSpin>();
    }

    #[test]
    fn ticket() {
        exercise::<RawTicket>();
    }

    #[test]
    fn ticket_counters_wrap() {
        let raw = RawTicket {
            next: AtomicU32::new(u32::MAX),
            serving: AtomicU32::new(u32::MAX),
        };
        raw.lock();
        unsafe { raw.unlock() };
        assert_eq!(raw.serving.load(Ordering::Relaxed), 0);
        assert!(raw.try_lock());
    }
}
