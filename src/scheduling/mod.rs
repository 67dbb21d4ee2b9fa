//! Pluggable scheduling algorithms.
//!
//! A [`Scheduling`] implementation owns the run queues of one scheduling group
//! and drives its workers. Implementations are looked up by name, so the
//! choice is a configuration value.

mod v1;
mod v2;
mod victim;

pub(crate) use victim::VictimQueue;

use crate::config::FiberConfig;
use crate::descriptor::{FiberDesc, RunnableEntity};
use crate::entity::{FiberPtr, SchedulerLock, SwitchAction, Switched};
use crate::error::{Error, Result};
use crate::group::SchedulingGroup;
use crate::sync::ExitBarrier;
use std::sync::{Arc, Weak};

pub(crate) trait Scheduling: Send + Sync {
    /// Called once, right after the owning group is allocated.
    fn init(&self, group: Weak<SchedulingGroup>);

    /// Called on a worker thread before it starts scheduling.
    fn enter(&self, worker_index: usize);

    /// Runs fibers until [`stop`](Self::stop) is called and no work is left.
    fn schedule(&self);

    /// Called on a worker thread after `schedule` returned.
    fn leave(&self);

    /// Submits a new fiber. Hands the descriptor back if the queue is full.
    fn start_fiber(&self, desc: Box<FiberDesc>) -> std::result::Result<(), Box<FiberDesc>>;

    /// Submits several fibers; returns the ones that did not fit.
    fn start_fibers(&self, descs: Vec<Box<FiberDesc>>) -> std::result::Result<(), Vec<Box<FiberDesc>>>;

    /// Blocks the calling fiber, whose scheduler lock is held, until resumed.
    fn suspend(&self, me: FiberPtr, lock: SchedulerLock);

    /// Makes a waiting fiber ready again.
    fn resume(&self, target: FiberPtr);

    /// Makes `target` ready and switches to it immediately. `me` stays runnable.
    fn resume_from(&self, me: FiberPtr, target: FiberPtr) {
        target.mark_ready(crate::entity::FiberState::Waiting);
        self.switch_to(me, target);
    }

    /// Lets other ready fibers run; returns at once if there are none.
    fn yield_now(&self, me: FiberPtr);

    /// Switches to the ready fiber `target`, requeueing the caller.
    fn switch_to(&self, me: FiberPtr, target: FiberPtr) {
        me.switch_to_master(SwitchAction::SwitchTo { target });
    }

    /// Master putting a fiber that just left the CPU back in a queue.
    fn requeue(&self, fiber: FiberPtr, yielded: bool);

    /// Wakes every worker and makes `schedule` return once the queues drain.
    fn stop(&self);

    /// Registers a group this one may steal from, once every `steal_every_n`
    /// attempts. Ignored by algorithms without foreign stealing.
    fn add_foreign_scheduling_group(&self, _group: &Arc<SchedulingGroup>, _steal_every_n: u64) {}

    /// Takes a fiber from a registered foreign group, if one is due.
    fn steal_fiber_from_foreign_scheduling_group(&self) -> Option<RunnableEntity> {
        None
    }

    /// Gives a fiber to a thief from another group. Group-local fibers stay.
    fn remote_acquire_fiber(&self) -> Option<RunnableEntity> {
        None
    }

    /// Fibers currently queued (approximate).
    fn queued(&self) -> usize;
}

type Factory = fn(usize, &FiberConfig) -> Box<dyn Scheduling>;

const REGISTRY: &[(&str, Factory)] = &[("v1", new_v1), ("v2", new_v2)];

fn new_v1(group_size: usize, config: &FiberConfig) -> Box<dyn Scheduling> {
    Box::new(v1::SchedulingV1::new(group_size, config))
}

fn new_v2(group_size: usize, config: &FiberConfig) -> Box<dyn Scheduling> {
    Box::new(v2::SchedulingV2::new(group_size, config))
}

pub(crate) fn is_registered(name: &str) -> bool {
    REGISTRY.iter().any(|(n, _)| *n == name)
}

pub(crate) fn create(name: &str, group_size: usize, config: &FiberConfig) -> Result<Box<dyn Scheduling>> {
    REGISTRY
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, factory)| factory(group_size, config))
        .ok_or_else(|| Error::UnknownScheduling(name.to_string()))
}

/// Master side of the worker loop: runs `entity` and whatever it hands
/// control to, carrying out each fiber's switch action once it is off-CPU.
pub(crate) fn run_fiber(
    scheduling: &dyn Scheduling,
    group: &SchedulingGroup,
    worker_index: usize,
    entity: RunnableEntity,
) {
    let mut next = Some(entity);
    while let Some(entity) = next.take() {
        let fiber = entity.into_fiber(group);
        match fiber.run(group, worker_index) {
            Switched::Exited(lock) => {
                // SAFETY: the coroutine returned; nothing refers to the fiber.
                unsafe { fiber.destroy() };
                group.fiber_exited();
                if let Some(lock) = lock {
                    ExitBarrier::count_down_locked(lock);
                }
            }
            Switched::Action(SwitchAction::Suspend { next: successor }) => {
                // SAFETY: `suspend` handed its scheduler lock over to us.
                unsafe { fiber.unlock_handed_over() };
                next = successor;
            }
            Switched::Action(SwitchAction::Yield { next: successor }) => {
                scheduling.requeue(fiber, true);
                next = successor;
            }
            Switched::Action(SwitchAction::SwitchTo { target }) => {
                scheduling.requeue(fiber, false);
                next = Some(RunnableEntity::Fiber(target));
            }
        }
    }
}
