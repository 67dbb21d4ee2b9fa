//! Runtime entry point.
//!
//! The [`Runtime`] owns every scheduling group, lays them out over the
//! machine's CPUs and wires up cross-group stealing. It is the only way to
//! start fibers from threads that are not fiber workers.

use crate::allocator::StackPool;
use crate::config::FiberConfig;
use crate::entity::{self, FiberEntity};
use crate::error::{Error, Result, fatal};
use crate::fiber::{Attributes, Fiber, LaunchPolicy, Placement};
use crate::group::SchedulingGroup;
use crate::topology::{self, Topology};
use crate::worker;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Shape of one scheduling group before it is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupPlan {
    pub node_id: usize,
    pub workers: usize,
    pub affinity: Vec<usize>,
}

/// Splits `total` workers into groups of at most `per_group`, as evenly as
/// possible.
fn split_evenly(total: usize, per_group: usize) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    let groups = total.div_ceil(per_group);
    let base = total / groups;
    let extra = total % groups;
    (0..groups).map(|i| base + usize::from(i < extra)).collect()
}

/// Decides how many groups to create, their sizes, nodes and CPU sets.
pub fn plan_groups(config: &FiberConfig, topology: &Topology) -> Vec<GroupPlan> {
    let per_group = config.workers_per_group.max(1);

    if config.numa_aware && topology.num_nodes > 1 {
        let total = config.effective_concurrency();
        let cpus_total: usize = topology.node_cores.values().map(Vec::len).sum();
        let mut plans = Vec::new();
        for (&node, cores) in &topology.node_cores {
            let cores: Vec<usize> = if config.cpu_affinity.is_empty() {
                cores.clone()
            } else {
                cores.iter().copied().filter(|c| config.cpu_affinity.contains(c)).collect()
            };
            if cores.is_empty() {
                continue;
            }
            // Workers proportional to the node's share of CPUs.
            let workers = (total * cores.len()).div_ceil(cpus_total.max(1)).max(1);
            for size in split_evenly(workers, per_group) {
                plans.push(GroupPlan {
                    node_id: node,
                    workers: size,
                    affinity: cores.clone(),
                });
            }
        }
        if !plans.is_empty() {
            return plans;
        }
    }

    split_evenly(config.effective_concurrency(), per_group)
        .into_iter()
        .map(|size| GroupPlan {
            node_id: 0,
            workers: size,
            affinity: config.cpu_affinity.clone(),
        })
        .collect()
}

/// State shared by the runtime handle and everything running inside it.
pub(crate) struct RuntimeShared {
    config: FiberConfig,
    topology: Topology,
    groups: Vec<Arc<SchedulingGroup>>,
    stack_pool: Arc<StackPool>,
    live_fibers: Arc<AtomicUsize>,
}

impl RuntimeShared {
    /// Runtime of the worker the caller is running on.
    pub(crate) fn current() -> Option<Arc<RuntimeShared>> {
        worker::current_group()?.runtime()
    }

    fn select_group(&self, placement: Placement) -> Result<&Arc<SchedulingGroup>> {
        match placement {
            Placement::Group(id) => self.groups.get(id).ok_or(Error::NoSuchGroup(id)),
            Placement::Random => Ok(self.random_group(&self.groups)),
            Placement::Nearest => {
                if let Some(current) = worker::current_group() {
                    if let Some(group) = self.groups.iter().find(|g| Arc::ptr_eq(g, &current)) {
                        return Ok(group);
                    }
                }
                if let Some(cpu) = topology::current_cpu() {
                    let node = self.topology.node_of(cpu);
                    let local: Vec<&Arc<SchedulingGroup>> =
                        self.groups.iter().filter(|g| g.node_id() == node).collect();
                    if !local.is_empty() {
                        return Ok(local[rand::rng().random_range(0..local.len())]);
                    }
                }
                Ok(self.random_group(&self.groups))
            }
        }
    }

    fn random_group<'a>(&self, groups: &'a [Arc<SchedulingGroup>]) -> &'a Arc<SchedulingGroup> {
        &groups[rand::rng().random_range(0..groups.len())]
    }

    pub(crate) fn try_spawn<F>(&self, attrs: &Attributes, work: F) -> Result<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let group = self.select_group(attrs.placement)?;
        let mut desc = attrs.describe(work);
        let fiber = Fiber::joinable_from(&mut desc);

        if attrs.launch_policy == LaunchPolicy::Dispatch {
            if let Some(me) = entity::current_fiber() {
                if std::ptr::eq(me.group(), group.as_ref()) {
                    group.fiber_started_inline();
                    let target = FiberEntity::instantiate(desc, group);
                    group.scheduling().switch_to(me, target);
                    return Ok(fiber);
                }
            }
        }

        if let Err(err) = group.try_start_fiber(desc) {
            fiber.detach();
            return Err(err);
        }
        Ok(fiber)
    }

    pub(crate) fn start_detached<F>(&self, attrs: &Attributes, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.select_group(attrs.placement) {
            Ok(group) => group.start_fiber(attrs.describe(work)),
            Err(err) => fatal!("failed to start detached fiber: {}", err),
        }
    }

    pub(crate) fn batch_start_detached<I, F>(&self, works: I)
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let attrs = Attributes::default();
        let descs: Vec<_> = works.into_iter().map(|work| attrs.describe(work)).collect();
        if descs.is_empty() {
            return;
        }
        match self.select_group(Placement::Nearest) {
            Ok(group) => group.start_fibers(descs),
            Err(err) => fatal!("failed to start fiber batch: {}", err),
        }
    }
}

/// The fiber runtime.
///
/// Dropping the runtime shuts it down like [`shutdown`](Self::shutdown).
pub struct Runtime {
    shared: Arc<RuntimeShared>,
    running: bool,
}

impl Runtime {
    /// Starts a runtime with `concurrency` workers and default settings.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use fiberrt::Runtime;
    ///
    /// let runtime = Runtime::new(4).unwrap();
    /// runtime.spawn(|| println!("hello from a fiber")).join();
    /// runtime.shutdown().unwrap();
    /// ```
    pub fn new(concurrency: usize) -> Result<Self> {
        Self::start(FiberConfig::with_concurrency(concurrency))
    }

    /// Starts a runtime with the given configuration.
    pub fn start(config: FiberConfig) -> Result<Self> {
        config.validate()?;
        let topology = Topology::detect();
        let plans = plan_groups(&config, &topology);
        if plans.is_empty() {
            return Err(Error::InvalidConfig("no workers to start".into()));
        }

        let stack_pool = StackPool::new(config.stack_size, config.guard_page, config.stack_pool_limit);
        let live_fibers = Arc::new(AtomicUsize::new(0));
        let groups = plans
            .iter()
            .enumerate()
            .map(|(id, plan)| {
                SchedulingGroup::new(
                    id,
                    plan.node_id,
                    plan.workers,
                    plan.affinity.clone(),
                    &config,
                    stack_pool.clone(),
                    live_fibers.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        for thief in &groups {
            for victim in &groups {
                if Arc::ptr_eq(thief, victim) {
                    continue;
                }
                let ratio = if thief.node_id() == victim.node_id() {
                    config.work_stealing_ratio
                } else {
                    config.cross_numa_work_stealing_ratio
                };
                if ratio != 0 {
                    thief.add_foreign_scheduling_group(victim, ratio);
                }
            }
        }

        let shared = Arc::new(RuntimeShared {
            config,
            topology,
            groups,
            stack_pool,
            live_fibers,
        });
        for group in &shared.groups {
            group.attach_runtime(Arc::downgrade(&shared));
        }
        // Dropping a partially started runtime stops the groups already running.
        let runtime = Runtime {
            shared,
            running: true,
        };
        for group in &runtime.shared.groups {
            group.start()?;
        }
        tracing::info!(
            groups = runtime.shared.groups.len(),
            scheduling = %runtime.shared.config.scheduling,
            "fiber runtime started"
        );
        Ok(runtime)
    }

    /// Spawns a joinable fiber.
    pub fn spawn<F>(&self, work: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn_with(Attributes::default(), work)
    }

    pub fn spawn_with<F>(&self, attrs: Attributes, work: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        match self.shared.try_spawn(&attrs, work) {
            Ok(fiber) => fiber,
            Err(err) => fatal!("failed to spawn fiber: {}", err),
        }
    }

    pub fn try_spawn_with<F>(&self, attrs: Attributes, work: F) -> Result<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.try_spawn(&attrs, work)
    }

    pub fn start_detached<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.start_detached(&Attributes::default(), work);
    }

    pub fn batch_start_detached<I, F>(&self, works: I)
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        self.shared.batch_start_detached(works);
    }

    pub fn group_count(&self) -> usize {
        self.shared.groups.len()
    }

    pub fn group(&self, id: usize) -> Result<&Arc<SchedulingGroup>> {
        self.shared.groups.get(id).ok_or(Error::NoSuchGroup(id))
    }

    pub fn groups(&self) -> &[Arc<SchedulingGroup>] {
        &self.shared.groups
    }

    pub fn worker_count(&self) -> usize {
        self.shared.groups.iter().map(|g| g.group_size()).sum()
    }

    pub fn config(&self) -> &FiberConfig {
        &self.shared.config
    }

    pub fn topology(&self) -> &Topology {
        &self.shared.topology
    }

    pub fn stack_pool(&self) -> &Arc<StackPool> {
        &self.shared.stack_pool
    }

    /// Fibers started and not yet finished.
    pub fn live_fibers(&self) -> usize {
        self.shared.live_fibers.load(Ordering::SeqCst)
    }

    /// Waits for every fiber to finish, then stops and joins all workers.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        if worker::current_worker_index().is_some() {
            fatal!("fiber runtime shut down from one of its own workers");
        }

        let mut backoff = Duration::from_micros(50);
        while self.shared.live_fibers.load(Ordering::SeqCst) != 0 {
            thread::sleep(backoff);
            backoff = (backoff * 2).min(Duration::from_millis(5));
        }

        for group in &self.shared.groups {
            group.stop();
        }
        let mut result = Ok(());
        for group in &self.shared.groups {
            if let Err(err) = group.join() {
                result = Err(err);
            }
        }
        tracing::info!("fiber runtime stopped");
        result
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown_inner() {
            tracing::error!(error = %err, "fiber runtime shutdown failed");
        }
    }
}
