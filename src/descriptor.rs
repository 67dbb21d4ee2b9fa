//! Fiber descriptors and run-queue entries.
//!
//! Spawning only builds a [`FiberDesc`]: a boxed closure plus a few flags. No
//! stack is touched until a worker dequeues the descriptor and resolves it into
//! a [`FiberEntity`](crate::entity::FiberEntity), so bursts of spawns stay cheap.

use crate::entity::{FiberEntity, FiberPtr};
use crate::error::fatal;
use crate::group::SchedulingGroup;
use crate::sync::ExitBarrier;
use std::time::Instant;

/// A spawn request that has not been given a stack yet.
pub(crate) struct FiberDesc {
    pub(crate) start_proc: Box<dyn FnOnce() + Send + 'static>,
    /// Never stolen by another scheduling group; v2 also pins it to one worker.
    pub(crate) scheduling_group_local: bool,
    /// Dedicated I/O reactor fiber.
    pub(crate) reactor: bool,
    /// When the descriptor became runnable.
    pub(crate) last_ready_at: Instant,
    /// Counted down when the fiber exits, if anyone is going to join it.
    pub(crate) exit_barrier: Option<ExitBarrier>,
}

impl FiberDesc {
    pub(crate) fn new<F>(work: F) -> Box<FiberDesc>
    where
        F: FnOnce() + Send + 'static,
    {
        Box::new(FiberDesc {
            start_proc: Box::new(work),
            scheduling_group_local: false,
            reactor: false,
            last_ready_at: Instant::now(),
            exit_barrier: None,
        })
    }
}

/// What run queues hold: either a descriptor still waiting for its stack or
/// a fiber that has run before and was made ready again.
pub(crate) enum RunnableEntity {
    Desc(Box<FiberDesc>),
    Fiber(FiberPtr),
}

impl RunnableEntity {
    pub(crate) fn is_local(&self) -> bool {
        match self {
            RunnableEntity::Desc(desc) => desc.scheduling_group_local,
            RunnableEntity::Fiber(fiber) => fiber.is_scheduling_group_local(),
        }
    }

    pub(crate) fn is_reactor(&self) -> bool {
        match self {
            RunnableEntity::Desc(desc) => desc.reactor,
            RunnableEntity::Fiber(fiber) => fiber.is_reactor(),
        }
    }

    /// Materializes the fiber, allocating its stack if this is a descriptor.
    pub(crate) fn into_fiber(self, group: &SchedulingGroup) -> FiberPtr {
        match self {
            RunnableEntity::Desc(desc) => FiberEntity::instantiate(desc, group),
            RunnableEntity::Fiber(fiber) => fiber,
        }
    }

    /// Recovers a descriptor handed back by a full queue.
    pub(crate) fn expect_desc(self) -> Box<FiberDesc> {
        match self {
            RunnableEntity::Desc(desc) => desc,
            RunnableEntity::Fiber(fiber) => {
                fatal!("run queue returned fiber {:?} where a descriptor was pushed", fiber)
            }
        }
    }
}
