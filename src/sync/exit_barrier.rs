//! Counter released when a fiber exits, used to implement join.

use super::waitable::{Waitable, block_on};
use crate::error::fatal;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::Arc;

struct BarrierState {
    count: usize,
    waiters: Waitable,
}

/// A thread-safe countdown shared between a fiber and whoever joins it.
#[derive(Clone)]
pub struct ExitBarrier {
    state: Arc<Mutex<BarrierState>>,
}

/// The barrier's lock, taken by an exiting fiber on its own stack and
/// released by the worker once the fiber is fully off that stack.
pub struct ExitBarrierLock(ArcMutexGuard<RawMutex, BarrierState>);

impl ExitBarrier {
    /// Creates a barrier that opens after one count-down.
    pub fn new() -> Self {
        Self::with_count(1)
    }

    pub fn with_count(count: usize) -> Self {
        ExitBarrier {
            state: Arc::new(Mutex::new(BarrierState {
                count,
                waiters: Waitable::new(),
            })),
        }
    }

    pub fn grab_lock(&self) -> ExitBarrierLock {
        ExitBarrierLock(self.state.lock_arc())
    }

    /// Counts down with the lock already held.
    pub fn count_down_locked(lock: ExitBarrierLock) {
        let mut state = lock.0;
        if state.count == 0 {
            fatal!("exit barrier counted down below zero");
        }
        state.count -= 1;
        if state.count != 0 {
            return;
        }
        let waiters = state.waiters.set_persistent_awakened();
        drop(state);
        for waiter in waiters {
            waiter.wake();
        }
    }

    pub fn count_down(&self) {
        Self::count_down_locked(self.grab_lock());
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let state = self.state.lock();
        if state.count == 0 {
            return;
        }
        block_on(&self.state, state, |s| &mut s.waiters, None, || {});
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().count == 0
    }
}

impl Default for ExitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_opens_after_count() {
        let barrier = ExitBarrier::with_count(2);
        barrier.count_down();
        assert!(!barrier.is_open());
        barrier.count_down();
        assert!(barrier.is_open());
        barrier.wait();
    }

    #[test]
    fn test_wait_from_thread() {
        let barrier = ExitBarrier::new();
        let remote = barrier.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let lock = remote.grab_lock();
            ExitBarrier::count_down_locked(lock);
        });
        barrier.wait();
        assert!(barrier.is_open());
        handle.join().unwrap();
    }
}
