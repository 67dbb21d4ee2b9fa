//! Timer a fiber (or thread) can block on.

use super::event::Event;
use crate::error::fatal;
use crate::group::SchedulingGroup;
use crate::timer::TimerId;
use std::sync::Arc;
use std::time::Instant;

/// Fires once at `expires_at`; [`wait`](Self::wait) blocks until then.
pub struct WaitableTimer {
    fired: Arc<Event>,
    group: Arc<SchedulingGroup>,
    timer: Option<TimerId>,
}

impl WaitableTimer {
    /// Arms the timer on the scheduling group of the calling worker.
    pub fn new(expires_at: Instant) -> Self {
        match SchedulingGroup::current() {
            Some(group) => Self::with_group(group, expires_at),
            None => fatal!("WaitableTimer created outside of a fiber worker"),
        }
    }

    pub fn with_group(group: Arc<SchedulingGroup>, expires_at: Instant) -> Self {
        let fired = Arc::new(Event::new());
        let target = fired.clone();
        let timer = group.create_timer(expires_at, move || target.set());
        group.enable_timer(&timer);
        WaitableTimer {
            fired,
            group,
            timer: Some(timer),
        }
    }

    pub fn wait(&self) {
        self.fired.wait();
    }

    pub fn has_fired(&self) -> bool {
        self.fired.is_set()
    }
}

impl Drop for WaitableTimer {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            self.group.remove_timer(timer);
        }
    }
}
