//! One-shot events.

use super::waitable::{Waitable, block_on};
use crate::error::fatal;
use crate::group::SchedulingGroup;
use crate::timer::TimerId;
use parking_lot::Mutex as RawLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Event that stays set once set. Waiters arriving afterwards return at once.
#[derive(Default)]
pub struct Event {
    waiters: RawLock<Waitable>,
}

impl Event {
    pub const fn new() -> Self {
        Event {
            waiters: RawLock::new(Waitable::new()),
        }
    }

    pub fn wait(&self) {
        let waiters = self.waiters.lock();
        block_on(&self.waiters, waiters, |w| w, None, || {});
    }

    /// Returns `false` if `deadline` passed before the event was set.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let waiters = self.waiters.lock();
        block_on(&self.waiters, waiters, |w| w, Some(deadline), || {})
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    pub fn set(&self) {
        let waiters = self.waiters.lock().set_persistent_awakened();
        for waiter in waiters {
            waiter.wake();
        }
    }

    pub fn is_set(&self) -> bool {
        self.waiters.lock().is_persistent_awakened()
    }
}

/// Event that sets itself at a deadline unless set earlier.
pub struct OneshotTimedEvent {
    event: Arc<Event>,
    group: Arc<SchedulingGroup>,
    timer: Option<TimerId>,
}

impl OneshotTimedEvent {
    /// Arms the event on the scheduling group of the calling worker.
    pub fn new(deadline: Instant) -> Self {
        match SchedulingGroup::current() {
            Some(group) => Self::with_group(group, deadline),
            None => fatal!("OneshotTimedEvent created outside of a fiber worker"),
        }
    }

    pub fn with_group(group: Arc<SchedulingGroup>, deadline: Instant) -> Self {
        let event = Arc::new(Event::new());
        let target = event.clone();
        let timer = group.create_timer(deadline, move || target.set());
        group.enable_timer(&timer);
        OneshotTimedEvent {
            event,
            group,
            timer: Some(timer),
        }
    }

    pub fn set(&self) {
        self.event.set();
    }

    pub fn wait(&self) {
        self.event.wait();
    }

    pub fn is_set(&self) -> bool {
        self.event.is_set()
    }
}

impl Drop for OneshotTimedEvent {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.group.remove_timer(timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_before_wait() {
        let event = Event::new();
        event.set();
        assert!(event.is_set());
        event.wait();
        assert!(event.wait_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_set_releases_waiting_threads() {
        let event = Arc::new(Event::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || event.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        event.set();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_timed_wait_expires() {
        let event = Event::new();
        assert!(!event.wait_for(Duration::from_millis(10)));
        assert!(!event.is_set());
    }
}
