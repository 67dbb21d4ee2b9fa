//! Condition variable paired with [`Mutex`](super::Mutex).

use super::mutex::MutexGuard;
use super::waitable::{Waitable, block_on};
use parking_lot::Mutex as RawLock;
use std::time::{Duration, Instant};

/// Whether a timed wait returned because its deadline passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitTimeoutResult(bool);

impl WaitTimeoutResult {
    pub fn timed_out(&self) -> bool {
        self.0
    }
}

#[derive(Default)]
pub struct ConditionVariable {
    waiters: RawLock<Waitable>,
}

impl ConditionVariable {
    pub const fn new() -> Self {
        ConditionVariable {
            waiters: RawLock::new(Waitable::new()),
        }
    }

    /// Atomically releases `guard` and blocks until notified, then relocks.
    ///
    /// The caller is queued before the mutex is released, so a notification
    /// sent after the unlock is never missed. Spurious wake-ups are possible.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = MutexGuard::mutex(&guard);
        self.block(guard, None);
        mutex.lock()
    }

    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard);
        }
        guard
    }

    pub fn wait_until<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Instant,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        let mutex = MutexGuard::mutex(&guard);
        let woken = self.block(guard, Some(deadline));
        (mutex.lock(), WaitTimeoutResult(!woken))
    }

    pub fn wait_for<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        self.wait_until(guard, Instant::now() + timeout)
    }

    pub fn notify_one(&self) {
        let waiter = self.waiters.lock().wake_one();
        if let Some(waiter) = waiter {
            waiter.wake();
        }
    }

    pub fn notify_all(&self) {
        let waiters = self.waiters.lock().wake_all();
        for waiter in waiters {
            waiter.wake();
        }
    }

    fn block<T: ?Sized>(&self, guard: MutexGuard<'_, T>, deadline: Option<Instant>) -> bool {
        let waiters = self.waiters.lock();
        block_on(&self.waiters, waiters, |w| w, deadline, move || drop(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Mutex;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_wakes_thread_waiter() {
        let pair = Arc::new((Mutex::new(false), ConditionVariable::new()));
        let remote = pair.clone();
        let handle = thread::spawn(move || {
            let (mutex, cv) = &*remote;
            *mutex.lock() = true;
            cv.notify_one();
        });
        let (mutex, cv) = &*pair;
        let guard = cv.wait_while(mutex.lock(), |ready| !*ready);
        assert!(*guard);
        drop(guard);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let mutex = Mutex::new(());
        let cv = ConditionVariable::new();
        let start = Instant::now();
        let (_guard, result) = cv.wait_for(mutex.lock(), Duration::from_millis(30));
        assert!(result.timed_out());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
