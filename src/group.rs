//! Scheduling groups.
//!
//! A group is a set of fiber workers sharing one scheduling algorithm instance,
//! one timer thread and (usually) one NUMA node. Fibers normally stay in the
//! group they were started in; idle groups may steal from the foreign groups
//! registered with them.

use crate::allocator::StackPool;
use crate::config::FiberConfig;
use crate::descriptor::FiberDesc;
use crate::error::{Error, Result, warn_every_second};
use crate::runtime::RuntimeShared;
use crate::scheduling::{self, Scheduling};
use crate::timer::{TimerId, TimerWorker};
use crate::worker::{self, FiberWorker};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const START_RETRY_DELAY: Duration = Duration::from_micros(100);
/// Attempts `try_start_fiber` makes before reporting overflow.
const START_RETRIES: usize = 16;

pub struct SchedulingGroup {
    id: usize,
    node_id: usize,
    group_size: usize,
    affinity: Vec<usize>,
    scheduling: Box<dyn Scheduling>,
    timer_worker: TimerWorker,
    workers: Mutex<Vec<FiberWorker>>,
    stack_pool: Arc<StackPool>,
    live_fibers: Arc<AtomicUsize>,
    runtime: OnceLock<Weak<RuntimeShared>>,
    started: AtomicBool,
}

impl SchedulingGroup {
    pub(crate) fn new(
        id: usize,
        node_id: usize,
        group_size: usize,
        affinity: Vec<usize>,
        config: &FiberConfig,
        stack_pool: Arc<StackPool>,
        live_fibers: Arc<AtomicUsize>,
    ) -> Result<Arc<Self>> {
        if group_size == 0 {
            return Err(Error::InvalidConfig(format!("scheduling group {} has no workers", id)));
        }
        let scheduling = scheduling::create(&config.scheduling, group_size, config)?;
        let group = Arc::new(SchedulingGroup {
            id,
            node_id,
            group_size,
            affinity,
            scheduling,
            timer_worker: TimerWorker::new(),
            workers: Mutex::new(Vec::new()),
            stack_pool,
            live_fibers,
            runtime: OnceLock::new(),
            started: AtomicBool::new(false),
        });
        group.scheduling.init(Arc::downgrade(&group));
        Ok(group)
    }

    /// Starts the timer thread and every worker.
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.timer_worker.start(format!("fiber-timer-{}", self.id))?;
        let mut workers = self.workers.lock();
        for index in 0..self.group_size {
            let cpu = match self.affinity.len() {
                0 => None,
                n => Some(self.affinity[index % n]),
            };
            workers.push(FiberWorker::start(self.clone(), index, cpu)?);
        }
        tracing::debug!(
            group = self.id,
            node = self.node_id,
            workers = self.group_size,
            "scheduling group started"
        );
        Ok(())
    }

    /// Asks workers to exit once their queues drain.
    pub(crate) fn stop(&self) {
        self.scheduling.stop();
        self.timer_worker.stop();
    }

    pub(crate) fn join(&self) -> Result<()> {
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut failed = None;
        for worker in workers {
            let index = worker.index();
            if worker.join().is_err() {
                tracing::error!(group = self.id, worker = index, "fiber worker panicked");
                failed = Some(index);
            }
        }
        self.timer_worker.join();
        match failed {
            Some(index) => Err(Error::WorkerPanicked(index)),
            None => Ok(()),
        }
    }

    pub(crate) fn add_foreign_scheduling_group(&self, victim: &Arc<SchedulingGroup>, steal_every_n: u64) {
        self.scheduling.add_foreign_scheduling_group(victim, steal_every_n);
    }

    /// Queues a fiber, retrying for as long as the run queue is full.
    pub(crate) fn start_fiber(&self, mut desc: Box<FiberDesc>) {
        self.live_fibers.fetch_add(1, Ordering::SeqCst);
        loop {
            match self.scheduling.start_fiber(desc) {
                Ok(()) => return,
                Err(rejected) => {
                    desc = rejected;
                    warn_every_second!(group = self.id, "run queue full, retrying fiber start");
                    thread::sleep(START_RETRY_DELAY);
                }
            }
        }
    }

    /// Like [`start_fiber`](Self::start_fiber) but gives up after a bounded
    /// number of attempts.
    pub(crate) fn try_start_fiber(&self, mut desc: Box<FiberDesc>) -> Result<()> {
        self.live_fibers.fetch_add(1, Ordering::SeqCst);
        for attempt in 0..START_RETRIES {
            match self.scheduling.start_fiber(desc) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    desc = rejected;
                    thread::sleep(START_RETRY_DELAY * (1 << attempt.min(6)));
                }
            }
        }
        self.live_fibers.fetch_sub(1, Ordering::SeqCst);
        Err(Error::RunQueueOverflow)
    }

    pub(crate) fn start_fibers(&self, descs: Vec<Box<FiberDesc>>) {
        self.live_fibers.fetch_add(descs.len(), Ordering::SeqCst);
        let mut pending = descs;
        while !pending.is_empty() {
            match self.scheduling.start_fibers(pending) {
                Ok(()) => return,
                Err(rest) => {
                    pending = rest;
                    warn_every_second!(group = self.id, left = pending.len(), "run queue full, retrying batch");
                    thread::sleep(START_RETRY_DELAY);
                }
            }
        }
    }

    /// Accounts for a fiber created without going through a run queue.
    pub(crate) fn fiber_started_inline(&self) {
        self.live_fibers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn fiber_exited(&self) {
        self.live_fibers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Creates a one-shot timer on this group's timer thread. It does not
    /// fire until enabled.
    pub fn create_timer<F>(&self, expires_at: Instant, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timer_worker.create(expires_at, None, callback)
    }

    /// Creates a timer firing at `expires_at` and then every `interval`.
    pub fn create_periodic_timer<F>(&self, expires_at: Instant, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timer_worker.create(expires_at, Some(interval), callback)
    }

    pub fn enable_timer(&self, timer: &TimerId) {
        self.timer_worker.enable(timer);
    }

    /// Cancels a timer. May be called from the timer's own callback.
    pub fn remove_timer(&self, timer: TimerId) {
        self.timer_worker.remove(timer);
    }

    /// Lets a timer fire without keeping a handle to it.
    pub fn detach_timer(&self, timer: TimerId) {
        self.timer_worker.detach(timer);
    }

    /// Number of timer callbacks run so far.
    pub fn timers_fired(&self) -> u64 {
        self.timer_worker.fired()
    }

    /// Group of the worker the caller runs on.
    pub fn current() -> Option<Arc<SchedulingGroup>> {
        worker::current_group()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn node_id(&self) -> usize {
        self.node_id
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn affinity(&self) -> &[usize] {
        &self.affinity
    }

    /// Fibers waiting in this group's run queues.
    pub fn queued_fibers(&self) -> usize {
        self.scheduling.queued()
    }

    pub(crate) fn attach_runtime(&self, runtime: Weak<RuntimeShared>) {
        let _ = self.runtime.set(runtime);
    }

    pub(crate) fn runtime(&self) -> Option<Arc<RuntimeShared>> {
        self.runtime.get().and_then(Weak::upgrade)
    }

    pub(crate) fn scheduling(&self) -> &dyn Scheduling {
        self.scheduling.as_ref()
    }

    pub(crate) fn stack_pool(&self) -> &Arc<StackPool> {
        &self.stack_pool
    }
}

impl std::fmt::Debug for SchedulingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingGroup")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("group_size", &self.group_size)
            .field("affinity", &self.affinity)
            .finish_non_exhaustive()
    }
}
