//! Operations on the calling fiber.
//!
//! Outside a fiber these fall back to the equivalent `std::thread` calls, so
//! code shared between fibers and plain threads can use them unconditionally.

use crate::entity::current_fiber;
use crate::sync::WaitableTimer;
use std::thread;
use std::time::{Duration, Instant};

/// Whether the caller is running on a fiber.
pub fn is_fiber_context() -> bool {
    current_fiber().is_some()
}

/// Lets other ready fibers of this group run.
pub fn yield_now() {
    match current_fiber() {
        Some(me) => me.group().scheduling().yield_now(me),
        None => thread::yield_now(),
    }
}

/// Suspends the calling fiber until `deadline`. Past deadlines return at once.
pub fn sleep_until(deadline: Instant) {
    if !is_fiber_context() {
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        return;
    }
    if deadline <= Instant::now() {
        return;
    }
    WaitableTimer::new(deadline).wait();
}

pub fn sleep_for(duration: Duration) {
    sleep_until(Instant::now() + duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_fallbacks() {
        assert!(!is_fiber_context());
        yield_now();
        let start = Instant::now();
        sleep_for(Duration::from_millis(10));
        assert!(start.elapsed() >= Duration::from_millis(10));
        sleep_until(Instant::now() - Duration::from_millis(1));
    }
}
