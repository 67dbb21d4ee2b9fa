//! Work-stealing scheduler.
//!
//! Every worker owns a local FIFO deque. New and resumed fibers go to the local
//! queue when produced on one of the group's workers (spilling to the group
//! queue once the local one holds `local_queue_capacity` entries), and to the
//! group queue otherwise. Yielded fibers always go to the group queue so they
//! do not starve the local queue's owner. Reactor fibers have a queue of their
//! own that is checked only when nothing else is runnable (and every
//! `REACTOR_CHECK_INTERVAL` acquisitions), and group-local fibers sit in a
//! per-worker pinned queue nobody steals from.
//!
//! Idle workers become thieves (bounded to half the group) and sweep the other
//! local queues and the group queue; the last thief to give up re-scans once
//! before parking, which closes the gap where work arrives while every thief
//! is finishing.

use super::{Scheduling, VictimQueue, run_fiber};
use crate::config::FiberConfig;
use crate::descriptor::{FiberDesc, RunnableEntity};
use crate::entity::{FiberPtr, FiberState, SchedulerLock, SwitchAction};
use crate::error::fatal;
use crate::group::SchedulingGroup;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam::queue::SegQueue;
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::atomic::{self, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

const VICTIM_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A busy worker still looks at the reactor queue this often.
const REACTOR_CHECK_INTERVAL: u32 = 61;

struct LocalQueue {
    owner: *const SchedulingV2,
    index: usize,
    queue: Worker<RunnableEntity>,
    ticks: Cell<u32>,
}

thread_local! {
    static LOCAL_QUEUE: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

enum Acquired {
    Runnable(RunnableEntity),
    ShuttingDown,
}

pub(crate) struct SchedulingV2 {
    group: OnceLock<Weak<SchedulingGroup>>,
    group_size: usize,
    local_capacity: usize,
    /// Local deques waiting for their worker to call `enter`.
    unclaimed: Mutex<Vec<Option<Worker<RunnableEntity>>>>,
    stealers: Box<[Stealer<RunnableEntity>]>,
    pinned: Box<[CachePadded<SegQueue<RunnableEntity>>]>,
    global: Injector<RunnableEntity>,
    reactor: Injector<RunnableEntity>,
    stopped: AtomicBool,
    thieves: CachePadded<AtomicUsize>,
    max_thieves: usize,
    sleepers: CachePadded<AtomicUsize>,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    victims: Box<[Mutex<VictimQueue>]>,
}

impl SchedulingV2 {
    pub(crate) fn new(group_size: usize, config: &FiberConfig) -> Self {
        if group_size == 0 {
            fatal!("v2 scheduling needs at least one worker");
        }
        let locals: Vec<Worker<RunnableEntity>> = (0..group_size).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        SchedulingV2 {
            group: OnceLock::new(),
            group_size,
            local_capacity: config.local_queue_capacity,
            unclaimed: Mutex::new(locals.into_iter().map(Some).collect()),
            stealers,
            pinned: (0..group_size).map(|_| CachePadded::new(SegQueue::new())).collect(),
            global: Injector::new(),
            reactor: Injector::new(),
            stopped: AtomicBool::new(false),
            thieves: CachePadded::new(AtomicUsize::new(0)),
            max_thieves: (group_size / 2).max(1),
            sleepers: CachePadded::new(AtomicUsize::new(0)),
            sleep_lock: Mutex::new(()),
            sleep_cv: Condvar::new(),
            victims: (0..group_size).map(|_| Mutex::new(VictimQueue::default())).collect(),
        }
    }

    fn group(&self) -> Option<Arc<SchedulingGroup>> {
        self.group.get().and_then(Weak::upgrade)
    }

    /// Index of the current thread if it is one of our workers.
    fn local_index(&self) -> Option<usize> {
        LOCAL_QUEUE.with(|slot| {
            slot.borrow()
                .as_ref()
                .filter(|local| ptr::eq(local.owner, self))
                .map(|local| local.index)
        })
    }

    fn try_push_local(&self, entity: RunnableEntity) -> Result<(), RunnableEntity> {
        LOCAL_QUEUE.with(|slot| match slot.borrow().as_ref() {
            Some(local) if ptr::eq(local.owner, self) && local.queue.len() < self.local_capacity => {
                local.queue.push(entity);
                Ok(())
            }
            _ => Err(entity),
        })
    }

    fn pop_local(&self) -> Option<RunnableEntity> {
        LOCAL_QUEUE.with(|slot| {
            slot.borrow()
                .as_ref()
                .filter(|local| ptr::eq(local.owner, self))
                .and_then(|local| local.queue.pop())
        })
    }

    /// Routes a runnable entity to the right queue and wakes a worker.
    fn push_ready(&self, entity: RunnableEntity, yielded: bool) {
        if entity.is_reactor() {
            self.reactor.push(entity);
        } else if entity.is_local() {
            let index = self.pinned_index(&entity);
            self.pinned[index].push(entity);
            if self.local_index() != Some(index) {
                // Only that worker may run it, so make sure it is awake.
                self.notify_all();
                return;
            }
        } else if yielded {
            self.global.push(entity);
        } else if let Err(entity) = self.try_push_local(entity) {
            self.global.push(entity);
        }
        self.notify_one();
    }

    fn pinned_index(&self, entity: &RunnableEntity) -> usize {
        let home = match entity {
            RunnableEntity::Fiber(fiber) => fiber.home_worker(),
            RunnableEntity::Desc(_) => None,
        };
        home.filter(|&i| i < self.group_size)
            .or_else(|| self.local_index())
            .unwrap_or_else(|| rand::rng().random_range(0..self.group_size))
    }

    fn notify_one(&self) {
        atomic::fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) == 0 || self.thieves.load(Ordering::SeqCst) != 0 {
            return;
        }
        let _guard = self.sleep_lock.lock();
        self.sleep_cv.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.sleep_lock.lock();
        self.sleep_cv.notify_all();
    }

    fn steal_global(&self) -> Option<RunnableEntity> {
        LOCAL_QUEUE.with(|slot| {
            let slot = slot.borrow();
            loop {
                let attempt = match slot.as_ref().filter(|local| ptr::eq(local.owner, self)) {
                    Some(local) => self.global.steal_batch_and_pop(&local.queue),
                    None => self.global.steal(),
                };
                match attempt {
                    Steal::Success(entity) => return Some(entity),
                    Steal::Empty => return None,
                    Steal::Retry => continue,
                }
            }
        })
    }

    fn steal_from(queue: &Injector<RunnableEntity>) -> Option<RunnableEntity> {
        loop {
            match queue.steal() {
                Steal::Success(entity) => return Some(entity),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    fn steal_from_peers(&self, index: usize) -> Option<RunnableEntity> {
        for offset in 1..self.group_size {
            let victim = (index + offset) % self.group_size;
            loop {
                match self.stealers[victim].steal() {
                    Steal::Success(entity) => return Some(entity),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }

    /// Counts an acquisition on this worker; true once per interval.
    fn reactor_due(&self) -> bool {
        LOCAL_QUEUE.with(|slot| {
            slot.borrow()
                .as_ref()
                .filter(|local| ptr::eq(local.owner, self))
                .is_some_and(|local| {
                    let ticks = local.ticks.get().wrapping_add(1);
                    local.ticks.set(ticks);
                    ticks % REACTOR_CHECK_INTERVAL == 0
                })
        })
    }

    fn acquire(&self, index: usize) -> Option<RunnableEntity> {
        if self.reactor_due() {
            if let Some(entity) = Self::steal_from(&self.reactor) {
                return Some(entity);
            }
        }
        self.pinned[index]
            .pop()
            .or_else(|| self.pop_local())
            .or_else(|| self.steal_global())
    }

    /// Last resort before parking.
    fn acquire_reactor(&self) -> Option<RunnableEntity> {
        Self::steal_from(&self.reactor)
    }

    fn has_work(&self, index: usize) -> bool {
        !self.reactor.is_empty()
            || !self.pinned[index].is_empty()
            || !self.global.is_empty()
            || self.stealers.iter().any(|s| !s.is_empty())
    }

    fn try_become_thief(&self) -> bool {
        let mut thieves = self.thieves.load(Ordering::SeqCst);
        while thieves < self.max_thieves {
            match self.thieves.compare_exchange_weak(
                thieves,
                thieves + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(current) => thieves = current,
            }
        }
        false
    }

    fn find_or_park(&self, index: usize) -> Acquired {
        let has_victims = !self.victims[index].lock().is_empty();
        loop {
            if self.try_become_thief() {
                let stolen = self
                    .steal_from_peers(index)
                    .or_else(|| self.steal_global());
                let last_thief = self.thieves.fetch_sub(1, Ordering::SeqCst) == 1;
                if let Some(entity) = stolen {
                    if last_thief {
                        self.notify_one();
                    }
                    return Acquired::Runnable(entity);
                }
                if last_thief && self.stealers.iter().any(|s| !s.is_empty()) {
                    continue;
                }
            }
            if let Some(entity) = self.steal_fiber_from_foreign_scheduling_group() {
                return Acquired::Runnable(entity);
            }
            if let Some(entity) = self.acquire(index).or_else(|| self.acquire_reactor()) {
                return Acquired::Runnable(entity);
            }

            let mut guard = self.sleep_lock.lock();
            self.sleepers.fetch_add(1, Ordering::SeqCst);
            atomic::fence(Ordering::SeqCst);
            if self.has_work(index) {
                self.sleepers.fetch_sub(1, Ordering::SeqCst);
                drop(guard);
                if let Some(entity) = self.acquire(index).or_else(|| self.acquire_reactor()) {
                    return Acquired::Runnable(entity);
                }
                continue;
            }
            if self.stopped.load(Ordering::SeqCst) {
                self.sleepers.fetch_sub(1, Ordering::SeqCst);
                return Acquired::ShuttingDown;
            }
            if has_victims {
                self.sleep_cv.wait_for(&mut guard, VICTIM_POLL_INTERVAL);
            } else {
                self.sleep_cv.wait(&mut guard);
            }
            self.sleepers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Scheduling for SchedulingV2 {
    fn init(&self, group: Weak<SchedulingGroup>) {
        if self.group.set(group).is_err() {
            fatal!("scheduling initialized twice");
        }
    }

    fn enter(&self, worker_index: usize) {
        let queue = match self.unclaimed.lock().get_mut(worker_index).and_then(Option::take) {
            Some(queue) => queue,
            None => fatal!("v2 worker {} entered twice or out of range", worker_index),
        };
        LOCAL_QUEUE.with(|slot| {
            *slot.borrow_mut() = Some(LocalQueue {
                owner: self,
                index: worker_index,
                queue,
                ticks: Cell::new(0),
            });
        });
    }

    fn schedule(&self) {
        let Some(group) = self.group() else {
            return;
        };
        let Some(index) = self.local_index() else {
            fatal!("v2 schedule called on a thread that did not enter");
        };
        loop {
            let entity = match self.acquire(index) {
                Some(entity) => entity,
                None => match self.find_or_park(index) {
                    Acquired::Runnable(entity) => entity,
                    Acquired::ShuttingDown => break,
                },
            };
            run_fiber(self, &group, index, entity);
        }
    }

    fn leave(&self) {
        let local = LOCAL_QUEUE.with(|slot| slot.borrow_mut().take());
        let Some(local) = local.filter(|local| ptr::eq(local.owner, self)) else {
            return;
        };
        while let Some(entity) = local.queue.pop() {
            self.global.push(entity);
        }
        if let Some(entry) = self.unclaimed.lock().get_mut(local.index) {
            *entry = Some(local.queue);
        }
    }

    fn start_fiber(&self, desc: Box<FiberDesc>) -> Result<(), Box<FiberDesc>> {
        self.push_ready(RunnableEntity::Desc(desc), false);
        Ok(())
    }

    fn start_fibers(&self, descs: Vec<Box<FiberDesc>>) -> Result<(), Vec<Box<FiberDesc>>> {
        let count = descs.len();
        for desc in descs {
            let entity = RunnableEntity::Desc(desc);
            if entity.is_local() || entity.is_reactor() {
                self.push_ready(entity, false);
            } else {
                self.global.push(entity);
            }
        }
        if count >= self.group_size {
            self.notify_all();
        } else {
            for _ in 0..count {
                self.notify_one();
            }
        }
        Ok(())
    }

    fn suspend(&self, me: FiberPtr, lock: SchedulerLock) {
        me.set_state(FiberState::Waiting);
        let me = lock.hand_over();
        me.switch_to_master(SwitchAction::Suspend { next: None });
    }

    fn resume(&self, target: FiberPtr) {
        target.mark_ready(FiberState::Waiting);
        self.push_ready(RunnableEntity::Fiber(target), false);
    }

    fn yield_now(&self, me: FiberPtr) {
        me.switch_to_master(SwitchAction::Yield { next: None });
    }

    fn requeue(&self, fiber: FiberPtr, yielded: bool) {
        fiber.mark_ready(FiberState::Running);
        self.push_ready(RunnableEntity::Fiber(fiber), yielded);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify_all();
    }

    fn add_foreign_scheduling_group(&self, group: &Arc<SchedulingGroup>, steal_every_n: u64) {
        for victims in self.victims.iter() {
            victims.lock().add(group, steal_every_n);
        }
    }

    fn steal_fiber_from_foreign_scheduling_group(&self) -> Option<RunnableEntity> {
        let index = self.local_index()?;
        self.victims[index].lock().steal()
    }

    fn remote_acquire_fiber(&self) -> Option<RunnableEntity> {
        // Group-local fibers live in pinned queues, so anything here may move.
        Self::steal_from(&self.global).or_else(|| {
            self.stealers.iter().find_map(|stealer| loop {
                match stealer.steal() {
                    Steal::Success(entity) => break Some(entity),
                    Steal::Empty => break None,
                    Steal::Retry => continue,
                }
            })
        })
    }

    fn queued(&self) -> usize {
        self.global.len()
            + self.reactor.len()
            + self.stealers.iter().map(Stealer::len).sum::<usize>()
            + self.pinned.iter().map(|q| q.len()).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> RunnableEntity {
        RunnableEntity::Desc(FiberDesc::new(|| {}))
    }

    fn reactor() -> RunnableEntity {
        let mut desc = FiberDesc::new(|| {});
        desc.reactor = true;
        RunnableEntity::Desc(desc)
    }

    #[test]
    fn test_yielded_fibers_go_to_group_queue() {
        let scheduling = SchedulingV2::new(2, &FiberConfig::default());
        scheduling.enter(0);

        scheduling.push_ready(plain(), false);
        assert_eq!(scheduling.stealers[0].len(), 1);
        assert!(scheduling.global.is_empty());

        scheduling.push_ready(plain(), true);
        assert_eq!(scheduling.stealers[0].len(), 1);
        assert_eq!(scheduling.global.len(), 1);

        // Another worker picks the yielded one up without stealing locals.
        let picked_up = std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    scheduling.enter(1);
                    let picked = scheduling.pop_local().is_none() && scheduling.acquire(1).is_some();
                    scheduling.leave();
                    picked
                })
                .join()
                .expect("peer worker panicked")
        });
        assert!(picked_up);
        assert!(scheduling.global.is_empty());
        assert_eq!(scheduling.stealers[0].len(), 1);
        scheduling.leave();
    }

    #[test]
    fn test_reactor_queue_is_checked_last() {
        let scheduling = SchedulingV2::new(1, &FiberConfig::default());
        scheduling.enter(0);

        scheduling.push_ready(reactor(), false);
        scheduling.push_ready(plain(), false);
        let first = scheduling.acquire(0).expect("no local work");
        assert!(!first.is_reactor());
        assert!(scheduling.acquire(0).is_none());
        let last = scheduling.acquire_reactor().expect("no reactor work");
        assert!(last.is_reactor());
        scheduling.leave();
    }

    #[test]
    fn test_busy_worker_still_polls_reactor() {
        let scheduling = SchedulingV2::new(1, &FiberConfig::default());
        scheduling.enter(0);

        scheduling.push_ready(reactor(), false);
        for _ in 0..100 {
            scheduling.push_ready(plain(), false);
        }
        let position = (1..=REACTOR_CHECK_INTERVAL as usize)
            .find(|_| scheduling.acquire(0).is_some_and(|entity| entity.is_reactor()));
        assert_eq!(position, Some(REACTOR_CHECK_INTERVAL as usize));
        scheduling.leave();
    }
}
