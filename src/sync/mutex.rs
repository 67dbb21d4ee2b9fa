//! Fiber-aware mutex.
//!
//! `count` is the number of contenders including the owner. The uncontended
//! path is a single CAS; contenders register under the internal lock and are
//! handed ownership directly on unlock, so a woken waiter never races again.

use super::waitable::{Waitable, block_on};
use parking_lot::Mutex as RawLock;
use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

/// Mutual exclusion usable from fibers and plain threads alike.
///
/// Blocking in a fiber suspends only that fiber; its worker keeps running
/// other fibers.
pub struct Mutex<T: ?Sized> {
    count: AtomicU32,
    slow: RawLock<Waitable>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by the lock protocol.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex {
            count: AtomicU32::new(0),
            slow: RawLock::new(Waitable::new()),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        if self
            .count
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_slow();
        }
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.count
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| MutexGuard { mutex: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn lock_slow(&self) {
        let waiters = self.slow.lock();
        if self.count.fetch_add(1, Ordering::Acquire) == 0 {
            return;
        }
        // Woken only by `unlock`, which transfers ownership to us.
        block_on(&self.slow, waiters, |w| w, None, || {});
    }

    fn unlock(&self) {
        if self.count.fetch_sub(1, Ordering::Release) == 1 {
            return;
        }
        let waiter = self.slow.lock().wake_one();
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Mutex::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("contenders", &self.count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(guard: &Self) -> &'a Mutex<T> {
        guard.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves ownership.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves ownership.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock() {
        let mutex = Mutex::new(1);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);
        *mutex.try_lock().unwrap() += 1;
        assert_eq!(mutex.into_inner(), 2);
    }

    #[test]
    fn test_threads_contend() {
        let mutex = Arc::new(Mutex::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 80_000);
    }
}
