//! Single shared run queue per group.
//!
//! All workers of a group pop from one bounded MPMC queue. Idle workers first
//! spin for a while (at most [`MAX_SPINNERS`] at a time), then try foreign
//! groups, then park on their own wait slot. Parked workers are tracked in a
//! bit mask so producers can wake exactly one of them.

use super::{Scheduling, VictimQueue, run_fiber};
use crate::config::{FiberConfig, MAX_WORKERS_PER_GROUP};
use crate::descriptor::{FiberDesc, RunnableEntity};
use crate::entity::{FiberPtr, FiberState, SchedulerLock, SwitchAction};
use crate::error::{fatal, warn_every_second};
use crate::group::SchedulingGroup;
use crate::sync::waitable::WaitSlot;
use crate::worker;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

const MAX_SPINNERS: usize = 2;
const SPIN_ROUNDS: usize = 1000;
/// Spinners look at the queue once every this many rounds.
const SPIN_POLL_EVERY: usize = 16;
/// Polls that find work a spinner could not take before it wakes a parked peer.
const STALL_POLLS: usize = 4;
/// Parked workers with foreign victims wake up this often to try stealing.
const VICTIM_POLL_INTERVAL: Duration = Duration::from_millis(1);
const PUSH_RETRY_DELAY: Duration = Duration::from_micros(100);

enum Acquired {
    Runnable(RunnableEntity),
    ShuttingDown,
}

pub(crate) struct SchedulingV1 {
    group: OnceLock<Weak<SchedulingGroup>>,
    group_size: usize,
    run_queue: ArrayQueue<RunnableEntity>,
    stopped: AtomicBool,
    spinning: CachePadded<AtomicUsize>,
    parked: CachePadded<AtomicU64>,
    wait_slots: Box<[CachePadded<WaitSlot>]>,
    victims: Box<[Mutex<VictimQueue>]>,
}

impl SchedulingV1 {
    pub(crate) fn new(group_size: usize, config: &FiberConfig) -> Self {
        if group_size == 0 || group_size > MAX_WORKERS_PER_GROUP {
            fatal!("v1 scheduling supports 1..={} workers, got {}", MAX_WORKERS_PER_GROUP, group_size);
        }
        let capacity = config.run_queue_capacity.next_power_of_two();
        SchedulingV1 {
            group: OnceLock::new(),
            group_size,
            run_queue: ArrayQueue::new(capacity),
            stopped: AtomicBool::new(false),
            spinning: CachePadded::new(AtomicUsize::new(0)),
            parked: CachePadded::new(AtomicU64::new(0)),
            wait_slots: (0..group_size).map(|_| CachePadded::new(WaitSlot::default())).collect(),
            victims: (0..group_size).map(|_| Mutex::new(VictimQueue::default())).collect(),
        }
    }

    fn worker_index(&self) -> usize {
        match worker::current_worker_index() {
            Some(index) if index < self.group_size => index,
            other => fatal!("v1 scheduling used from non-worker thread (index {:?})", other),
        }
    }

    fn push(&self, entity: RunnableEntity) -> Result<(), RunnableEntity> {
        self.run_queue.push(entity)?;
        self.wake_one_worker();
        Ok(())
    }

    /// Pushes a fiber that is already running somewhere; never gives up.
    fn push_forever(&self, mut entity: RunnableEntity) {
        loop {
            match self.run_queue.push(entity) {
                Ok(()) => break,
                Err(rejected) => {
                    entity = rejected;
                    warn_every_second!(capacity = self.run_queue.capacity(), "run queue overflow, retrying");
                    thread::sleep(PUSH_RETRY_DELAY);
                }
            }
        }
        self.wake_one_worker();
    }

    fn wake_one_worker(&self) {
        // A spinner will pick the fiber up.
        if self.spinning.load(Ordering::SeqCst) != 0 {
            return;
        }
        self.wake_parked_worker();
    }

    fn wake_parked_worker(&self) {
        let mut mask = self.parked.load(Ordering::SeqCst);
        while mask != 0 {
            let index = mask.trailing_zeros() as usize;
            match self.parked.compare_exchange_weak(
                mask,
                mask & !(1 << index),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.wait_slots[index].wake();
                    return;
                }
                Err(current) => mask = current,
            }
        }
    }

    fn wake_workers(&self, count: usize) {
        if count >= self.group_size {
            let mask = self.parked.swap(0, Ordering::SeqCst);
            for index in (0..self.group_size).filter(|i| mask & (1 << i) != 0) {
                self.wait_slots[index].wake();
            }
            return;
        }
        for _ in 0..count {
            self.wake_one_worker();
        }
    }

    fn spinning_acquire_fiber(&self) -> Option<RunnableEntity> {
        let spinners = self.spinning.fetch_add(1, Ordering::SeqCst);
        let acquired = if spinners < MAX_SPINNERS {
            self.spin()
        } else {
            None
        };
        self.spinning.fetch_sub(1, Ordering::SeqCst);
        if acquired.is_some() && !self.run_queue.is_empty() {
            // More work behind us; get another worker going.
            self.wake_one_worker();
        }
        acquired
    }

    fn spin(&self) -> Option<RunnableEntity> {
        let mut stalled = 0;
        for round in 0..SPIN_ROUNDS {
            if round % SPIN_POLL_EVERY == 0 {
                if let Some(entity) = self.run_queue.pop() {
                    return Some(entity);
                }
                if self.stopped.load(Ordering::Relaxed) {
                    return None;
                }
                self.note_failed_poll(&mut stalled);
            }
            hint::spin_loop();
        }
        None
    }

    /// Work is queued but the spinners keep missing it: get a parked worker
    /// going instead of relying on them.
    fn note_failed_poll(&self, stalled: &mut usize) {
        if self.run_queue.is_empty() {
            *stalled = 0;
            return;
        }
        *stalled += 1;
        if *stalled == STALL_POLLS {
            *stalled = 0;
            self.wake_parked_worker();
        }
    }

    fn wait_for_fiber(&self, index: usize) -> Acquired {
        let bit = 1u64 << index;
        let has_victims = !self.victims[index].lock().is_empty();
        loop {
            self.parked.fetch_or(bit, Ordering::SeqCst);
            // Re-check after publishing ourselves; a producer that missed the
            // bit must have pushed before this pop.
            if let Some(entity) = self.run_queue.pop() {
                self.parked.fetch_and(!bit, Ordering::SeqCst);
                return Acquired::Runnable(entity);
            }
            if self.stopped.load(Ordering::SeqCst) {
                self.parked.fetch_and(!bit, Ordering::SeqCst);
                return Acquired::ShuttingDown;
            }
            if has_victims {
                self.wait_slots[index].wait_until(Instant::now() + VICTIM_POLL_INTERVAL);
            } else {
                self.wait_slots[index].wait();
            }
            self.parked.fetch_and(!bit, Ordering::SeqCst);

            if let Some(entity) = self.run_queue.pop() {
                return Acquired::Runnable(entity);
            }
            if let Some(entity) = self.steal_fiber_from_foreign_scheduling_group() {
                return Acquired::Runnable(entity);
            }
        }
    }

    fn group(&self) -> Option<Arc<SchedulingGroup>> {
        self.group.get().and_then(Weak::upgrade)
    }
}

impl Scheduling for SchedulingV1 {
    fn init(&self, group: Weak<SchedulingGroup>) {
        if self.group.set(group).is_err() {
            fatal!("scheduling initialized twice");
        }
    }

    fn enter(&self, worker_index: usize) {
        tracing::trace!(worker = worker_index, "v1 worker entered");
    }

    fn schedule(&self) {
        let Some(group) = self.group() else {
            return;
        };
        let index = self.worker_index();
        loop {
            let entity = match self
                .run_queue
                .pop()
                .or_else(|| self.spinning_acquire_fiber())
                .or_else(|| self.steal_fiber_from_foreign_scheduling_group())
            {
                Some(entity) => entity,
                None => match self.wait_for_fiber(index) {
                    Acquired::Runnable(entity) => entity,
                    Acquired::ShuttingDown => break,
                },
            };
            run_fiber(self, &group, index, entity);
        }
    }

    fn leave(&self) {
        tracing::trace!(queued = self.run_queue.len(), "v1 worker left");
    }

    fn start_fiber(&self, desc: Box<FiberDesc>) -> Result<(), Box<FiberDesc>> {
        self.push(RunnableEntity::Desc(desc))
            .map_err(RunnableEntity::expect_desc)
    }

    fn start_fibers(&self, descs: Vec<Box<FiberDesc>>) -> Result<(), Vec<Box<FiberDesc>>> {
        let total = descs.len();
        let mut pushed = 0;
        let mut descs = descs.into_iter();
        let mut rejected = None;
        for desc in descs.by_ref() {
            if let Err(entity) = self.run_queue.push(RunnableEntity::Desc(desc)) {
                rejected = Some(entity.expect_desc());
                break;
            }
            pushed += 1;
        }
        self.wake_workers(pushed);
        match rejected {
            None => Ok(()),
            Some(first) => {
                let mut remaining = Vec::with_capacity(total - pushed);
                remaining.push(first);
                remaining.extend(descs);
                Err(remaining)
            }
        }
    }

    fn suspend(&self, me: FiberPtr, lock: SchedulerLock) {
        me.set_state(FiberState::Waiting);
        let next = self.run_queue.pop();
        let me = lock.hand_over();
        me.switch_to_master(SwitchAction::Suspend { next });
    }

    fn resume(&self, target: FiberPtr) {
        target.mark_ready(FiberState::Waiting);
        self.push_forever(RunnableEntity::Fiber(target));
    }

    fn yield_now(&self, me: FiberPtr) {
        let Some(next) = self.run_queue.pop() else {
            return;
        };
        me.switch_to_master(SwitchAction::Yield { next: Some(next) });
    }

    fn requeue(&self, fiber: FiberPtr, _yielded: bool) {
        fiber.mark_ready(FiberState::Running);
        self.push_forever(RunnableEntity::Fiber(fiber));
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for slot in self.wait_slots.iter() {
            slot.persistent_wake();
        }
    }

    fn add_foreign_scheduling_group(&self, group: &Arc<SchedulingGroup>, steal_every_n: u64) {
        for victims in self.victims.iter() {
            victims.lock().add(group, steal_every_n);
        }
    }

    fn steal_fiber_from_foreign_scheduling_group(&self) -> Option<RunnableEntity> {
        let index = worker::current_worker_index()?;
        self.victims.get(index)?.lock().steal()
    }

    fn remote_acquire_fiber(&self) -> Option<RunnableEntity> {
        let entity = self.run_queue.pop()?;
        if entity.is_local() {
            self.push_forever(entity);
            return None;
        }
        Some(entity)
    }

    fn queued(&self) -> usize {
        self.run_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parked_on(scheduling: &SchedulingV1, index: usize) {
        scheduling.parked.fetch_or(1 << index, Ordering::SeqCst);
    }

    #[test]
    fn test_spinners_suppress_producer_wakeups() {
        let scheduling = SchedulingV1::new(2, &FiberConfig::default());
        parked_on(&scheduling, 1);
        scheduling.spinning.fetch_add(1, Ordering::SeqCst);
        scheduling.wake_one_worker();
        assert_eq!(scheduling.parked.load(Ordering::SeqCst), 1 << 1);

        scheduling.spinning.fetch_sub(1, Ordering::SeqCst);
        scheduling.wake_one_worker();
        assert_eq!(scheduling.parked.load(Ordering::SeqCst), 0);
        assert!(scheduling.wait_slots[1].wait_until(Instant::now() + Duration::from_secs(1)));
    }

    #[test]
    fn test_stalled_spinner_wakes_parked_worker() {
        let scheduling = SchedulingV1::new(2, &FiberConfig::default());
        assert!(scheduling.run_queue.push(RunnableEntity::Desc(FiberDesc::new(|| {}))).is_ok());
        parked_on(&scheduling, 1);

        let mut stalled = 0;
        for _ in 1..STALL_POLLS {
            scheduling.note_failed_poll(&mut stalled);
        }
        assert_eq!(scheduling.parked.load(Ordering::SeqCst), 1 << 1);
        scheduling.note_failed_poll(&mut stalled);
        assert_eq!(scheduling.parked.load(Ordering::SeqCst), 0);
        assert_eq!(stalled, 0);
        assert!(scheduling.wait_slots[1].wait_until(Instant::now() + Duration::from_secs(1)));
    }

    #[test]
    fn test_empty_queue_resets_stall_count() {
        let scheduling = SchedulingV1::new(1, &FiberConfig::default());
        let mut stalled = STALL_POLLS - 1;
        scheduling.note_failed_poll(&mut stalled);
        assert_eq!(stalled, 0);
    }
}
