//! Spawning and joining fibers.
//!
//! A [`Fiber`] is the handle to a spawned fiber. It must be consumed by either
//! [`join`](Fiber::join) or [`detach`](Fiber::detach); dropping a joinable
//! handle is a fatal error, the same contract `std::thread::JoinHandle` makes
//! optional.

use crate::descriptor::FiberDesc;
use crate::error::{Error, Result, fatal};
use crate::runtime::RuntimeShared;
use crate::sync::ExitBarrier;

/// Which scheduling group a new fiber is placed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Placement {
    /// The caller's group, or a group on the caller's NUMA node, or any group.
    #[default]
    Nearest,
    /// A uniformly random group.
    Random,
    /// This group id.
    Group(usize),
}

/// When a new fiber starts running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LaunchPolicy {
    /// Queue it; the caller keeps running.
    #[default]
    Post,
    /// Switch to it right away and queue the caller instead. Only takes effect
    /// when called from a fiber of the target group; otherwise acts as `Post`.
    Dispatch,
}

/// Options for starting a fiber.
#[derive(Clone, Debug, Default)]
pub struct Attributes {
    pub placement: Placement,
    pub launch_policy: LaunchPolicy,
    /// Never stolen by other scheduling groups.
    pub scheduling_group_local: bool,
    /// The fiber runs an I/O reactor loop.
    pub reactor: bool,
}

impl Attributes {
    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    pub fn launch_policy(mut self, launch_policy: LaunchPolicy) -> Self {
        self.launch_policy = launch_policy;
        self
    }

    pub fn scheduling_group_local(mut self, local: bool) -> Self {
        self.scheduling_group_local = local;
        self
    }

    pub fn reactor(mut self, reactor: bool) -> Self {
        self.reactor = reactor;
        self
    }

    pub(crate) fn describe<F>(&self, work: F) -> Box<FiberDesc>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut desc = FiberDesc::new(work);
        desc.scheduling_group_local = self.scheduling_group_local;
        desc.reactor = self.reactor;
        desc
    }
}

/// Handle to a spawned fiber.
#[must_use = "a fiber must be joined or detached"]
pub struct Fiber {
    exit_barrier: Option<ExitBarrier>,
}

impl Fiber {
    /// Spawns a fiber in the runtime the caller is running in.
    ///
    /// Aborts if called outside a fiber runtime; use
    /// [`Runtime::spawn`](crate::Runtime::spawn) from plain threads.
    pub fn spawn<F>(work: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn_with(Attributes::default(), work)
    }

    pub fn spawn_with<F>(attrs: Attributes, work: F) -> Fiber
    where
        F: FnOnce() + Send + 'static,
    {
        match Self::try_spawn_with(attrs, work) {
            Ok(fiber) => fiber,
            Err(err) => fatal!("failed to spawn fiber: {}", err),
        }
    }

    /// Like [`spawn_with`](Self::spawn_with) but reports failures, including
    /// a run queue that stayed full.
    pub fn try_spawn_with<F>(attrs: Attributes, work: F) -> Result<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let runtime = RuntimeShared::current().ok_or(Error::NoRuntime)?;
        runtime.try_spawn(&attrs, work)
    }

    pub(crate) fn joinable_from(desc: &mut FiberDesc) -> Fiber {
        let barrier = ExitBarrier::new();
        desc.exit_barrier = Some(barrier.clone());
        Fiber {
            exit_barrier: Some(barrier),
        }
    }

    pub fn joinable(&self) -> bool {
        self.exit_barrier.is_some()
    }

    /// Blocks until the fiber has finished.
    pub fn join(mut self) {
        if let Some(barrier) = self.exit_barrier.take() {
            barrier.wait();
        }
    }

    /// Lets the fiber run on its own.
    pub fn detach(mut self) {
        self.exit_barrier = None;
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        if self.exit_barrier.is_some() && !std::thread::panicking() {
            fatal!("joinable fiber dropped without join or detach");
        }
    }
}

/// Starts a fiber nobody will join, in the caller's runtime.
pub fn start_detached<F>(work: F)
where
    F: FnOnce() + Send + 'static,
{
    match RuntimeShared::current() {
        Some(runtime) => runtime.start_detached(&Attributes::default(), work),
        None => fatal!("start_detached called outside of a fiber runtime"),
    }
}

/// Starts many detached fibers at once, in the caller's runtime.
pub fn batch_start_detached<I, F>(works: I)
where
    I: IntoIterator<Item = F>,
    F: FnOnce() + Send + 'static,
{
    match RuntimeShared::current() {
        Some(runtime) => runtime.batch_start_detached(works),
        None => fatal!("batch_start_detached called outside of a fiber runtime"),
    }
}
