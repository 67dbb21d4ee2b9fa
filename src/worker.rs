//! Fiber worker threads.
//!
//! Each worker is an OS thread, optionally pinned to a CPU, that enters its
//! group's scheduling algorithm and runs fibers until the group stops. The
//! worker's own stack is the "master" context every fiber switches back to.

use crate::error::Result;
use crate::group::SchedulingGroup;
use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct WorkerContext {
    group: Arc<SchedulingGroup>,
    index: usize,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Group of the worker thread we are running on.
///
/// Never inlined, for the same reason as `entity::current_fiber`: a fiber may
/// resume on a different worker thread.
#[inline(never)]
pub(crate) fn current_group() -> Option<Arc<SchedulingGroup>> {
    CURRENT_WORKER.with(|ctx| ctx.borrow().as_ref().map(|ctx| ctx.group.clone()))
}

#[inline(never)]
pub(crate) fn current_worker_index() -> Option<usize> {
    CURRENT_WORKER.with(|ctx| ctx.borrow().as_ref().map(|ctx| ctx.index))
}

/// A worker thread that runs the fibers of one scheduling group.
pub(crate) struct FiberWorker {
    index: usize,
    handle: Option<JoinHandle<()>>,
}

impl FiberWorker {
    /// Starts the worker thread, pinned to `cpu` if given.
    pub(crate) fn start(group: Arc<SchedulingGroup>, index: usize, cpu: Option<usize>) -> Result<Self> {
        let name = format!("fiber-worker-{}-{}", group.id(), index);
        let handle = thread::Builder::new().name(name).spawn(move || {
            if let Some(cpu) = cpu {
                if !core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
                    tracing::warn!(group = group.id(), worker = index, cpu, "failed to pin worker");
                }
            }
            Self::run(group, index);
        })?;
        Ok(FiberWorker {
            index,
            handle: Some(handle),
        })
    }

    fn run(group: Arc<SchedulingGroup>, index: usize) {
        CURRENT_WORKER.with(|ctx| {
            *ctx.borrow_mut() = Some(WorkerContext {
                group: group.clone(),
                index,
            });
        });
        tracing::debug!(group = group.id(), worker = index, "fiber worker started");

        let scheduling = group.scheduling();
        scheduling.enter(index);
        scheduling.schedule();
        scheduling.leave();

        tracing::debug!(group = group.id(), worker = index, "fiber worker stopped");
        CURRENT_WORKER.with(|ctx| ctx.borrow_mut().take());
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Waits for the worker thread to finish.
    pub(crate) fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}
