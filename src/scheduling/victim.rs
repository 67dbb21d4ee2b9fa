//! Foreign groups a worker may steal from, ordered by when each is due.

use crate::descriptor::RunnableEntity;
use crate::group::SchedulingGroup;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};

struct Victim {
    group: Weak<SchedulingGroup>,
    steal_every_n: u64,
    next_steal: u64,
}

impl PartialEq for Victim {
    fn eq(&self, other: &Self) -> bool {
        self.next_steal == other.next_steal
    }
}

impl Eq for Victim {}

impl PartialOrd for Victim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Victim {
    // Earliest `next_steal` on top of the max-heap.
    fn cmp(&self, other: &Self) -> Ordering {
        other.next_steal.cmp(&self.next_steal)
    }
}

/// Per-worker steal schedule. Each call to [`steal`](Self::steal) is one
/// tick; a victim registered with ratio N is tried on every Nth tick.
#[derive(Default)]
pub(crate) struct VictimQueue {
    victims: BinaryHeap<Victim>,
    clock: u64,
}

impl VictimQueue {
    pub(crate) fn add(&mut self, group: &Arc<SchedulingGroup>, steal_every_n: u64) {
        let steal_every_n = steal_every_n.max(1);
        // Spread victims out so workers don't all hit the same group at once.
        let offset = rand::rng().random_range(0..steal_every_n);
        self.victims.push(Victim {
            group: Arc::downgrade(group),
            steal_every_n,
            next_steal: self.clock + offset + 1,
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }

    pub(crate) fn steal(&mut self) -> Option<RunnableEntity> {
        if self.victims.is_empty() {
            return None;
        }
        self.clock += 1;
        loop {
            match self.victims.peek() {
                Some(top) if top.next_steal <= self.clock => {}
                _ => return None,
            }
            let mut victim = self.victims.pop()?;
            let Some(group) = victim.group.upgrade() else {
                continue;
            };
            victim.next_steal = self.clock + victim.steal_every_n;
            let stolen = group.scheduling().remote_acquire_fiber();
            self.victims.push(victim);
            if stolen.is_some() {
                tracing::trace!(victim = group.id(), "stole fiber from foreign group");
                return stolen;
            }
        }
    }
}
