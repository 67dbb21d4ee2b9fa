//! Fiber entities: a stack, a coroutine and the scheduling state around them.
//!
//! An entity is heap allocated once a worker resolves a descriptor and is
//! referenced everywhere else through [`FiberPtr`]. Only the worker loop (the
//! "master" context of each worker thread) ever resumes a coroutine; fibers
//! leave by suspending to master with a [`SwitchAction`] telling it what to do
//! once the fiber is safely off its stack.
//!
//! State transitions happen under the entity's scheduler lock:
//!
//! ```text
//! Ready --master--> Running --suspend--> Waiting --resume--> Ready
//!                      |  \--yield/switch--> Ready
//!                      \--return--> Dead
//! ```

use crate::allocator::{FiberStack, StackPool};
use crate::descriptor::{FiberDesc, RunnableEntity};
use crate::error::{fatal, warn_every_second};
use crate::group::SchedulingGroup;
use crate::sync::ExitBarrierLock;
use crate::timer::{instant_to_nanos, monotonic_nanos};
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// "FIBERENT" in ASCII.
pub(crate) const FIBER_MAGIC: u64 = 0x4649_4245_5245_4e54;

/// Fibers that sat in a run queue longer than this are reported at trace level.
const SCHEDULING_LATENCY_REPORT_NANOS: u64 = 10_000_000;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FiberState {
    Ready = 0,
    Running = 1,
    Waiting = 2,
    Dead = 3,
}

impl FiberState {
    fn from_u8(value: u8) -> FiberState {
        match value {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Waiting,
            _ => FiberState::Dead,
        }
    }
}

/// What a fiber asks master to do after it has switched away.
pub(crate) enum SwitchAction {
    /// The fiber is now `Waiting`; master releases its scheduler lock.
    Suspend { next: Option<RunnableEntity> },
    /// The fiber stays runnable; master puts it back in a queue.
    Yield { next: Option<RunnableEntity> },
    /// Requeue the fiber and run `target` right away.
    SwitchTo { target: FiberPtr },
}

type FiberCoroutine = Coroutine<(), SwitchAction, Option<ExitBarrierLock>, FiberStack>;

pub(crate) struct FiberEntity {
    magic: u64,
    state: AtomicU8,
    scheduler_lock: parking_lot::Mutex<()>,
    /// Group of the worker that last ran the fiber.
    group: AtomicPtr<SchedulingGroup>,
    scheduling_group_local: bool,
    reactor: bool,
    /// Worker a group-local fiber is pinned to, `usize::MAX` until first run.
    home_worker: AtomicUsize,
    ready_since: AtomicU64,
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
    yielder: Cell<*const Yielder<(), SwitchAction>>,
    pool: Arc<StackPool>,
}

// SAFETY: the coroutine and yielder are only touched by the thread currently
// running the fiber, which the scheduler lock and state machine make unique.
unsafe impl Send for FiberEntity {}
unsafe impl Sync for FiberEntity {}

/// Shared reference to a live fiber entity.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct FiberPtr(NonNull<FiberEntity>);

// SAFETY: see `FiberEntity`.
unsafe impl Send for FiberPtr {}
unsafe impl Sync for FiberPtr {}

impl Deref for FiberPtr {
    type Target = FiberEntity;

    fn deref(&self) -> &FiberEntity {
        // SAFETY: an entity outlives every pointer to it; it is only freed by
        // master after the fiber returned, when nobody can reach it any more.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for FiberPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({:p})", self.0.as_ptr())
    }
}

/// Proof that a fiber's scheduler lock is held.
///
/// Dropping it unlocks. A suspending fiber instead hands it to master via
/// [`hand_over`](Self::hand_over) so the lock stays held across the switch.
#[must_use]
pub(crate) struct SchedulerLock {
    fiber: FiberPtr,
}

impl SchedulerLock {
    pub(crate) fn hand_over(self) -> FiberPtr {
        let fiber = self.fiber;
        std::mem::forget(self);
        fiber
    }
}

impl Drop for SchedulerLock {
    fn drop(&mut self) {
        // SAFETY: the lock was taken in `FiberPtr::lock` and leaked there.
        unsafe { self.fiber.scheduler_lock.force_unlock() };
    }
}

thread_local! {
    static CURRENT_FIBER: Cell<Option<FiberPtr>> = const { Cell::new(None) };
}

/// The fiber running on this thread, if any.
///
/// Never inlined: a fiber can resume on another thread, and a cached
/// thread-local address would then point at the old thread's slot.
#[inline(never)]
pub(crate) fn current_fiber() -> Option<FiberPtr> {
    CURRENT_FIBER.with(Cell::get)
}

#[inline(never)]
fn set_current_fiber(fiber: Option<FiberPtr>) -> Option<FiberPtr> {
    CURRENT_FIBER.with(|current| current.replace(fiber))
}

/// How a fiber left the CPU.
pub(crate) enum Switched {
    Action(SwitchAction),
    Exited(Option<ExitBarrierLock>),
}

impl FiberEntity {
    /// Gives a descriptor a stack and a coroutine. The new fiber is `Ready`.
    pub(crate) fn instantiate(desc: Box<FiberDesc>, group: &SchedulingGroup) -> FiberPtr {
        let pool = group.stack_pool().clone();
        let stack = loop {
            match pool.allocate() {
                Some(stack) => break stack,
                None => {
                    warn_every_second!("failed to allocate a fiber stack, retrying");
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        };
        let FiberDesc {
            start_proc,
            scheduling_group_local,
            reactor,
            last_ready_at,
            exit_barrier,
        } = *desc;

        let entity = Box::new(FiberEntity {
            magic: FIBER_MAGIC,
            state: AtomicU8::new(FiberState::Ready as u8),
            scheduler_lock: parking_lot::Mutex::new(()),
            group: AtomicPtr::new(group as *const SchedulingGroup as *mut SchedulingGroup),
            scheduling_group_local,
            reactor,
            home_worker: AtomicUsize::new(usize::MAX),
            ready_since: AtomicU64::new(instant_to_nanos(last_ready_at)),
            coroutine: UnsafeCell::new(None),
            yielder: Cell::new(ptr::null()),
            pool,
        });
        let fiber = FiberPtr(NonNull::from(Box::leak(entity)));
        stack.set_owner(fiber.0.as_ptr() as *const ());

        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<(), SwitchAction>, ()| {
            fiber.yielder.set(yielder as *const _);
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(start_proc)) {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(fiber = ?fiber, panic = %message, "fiber panicked");
            }
            fiber.yielder.set(ptr::null());
            exit_barrier.map(|barrier| barrier.grab_lock())
        });
        // SAFETY: nobody else can see the entity yet.
        unsafe { *fiber.coroutine.get() = Some(coroutine) };
        fiber
    }
}

impl FiberPtr {
    pub(crate) fn magic(self) -> u64 {
        self.magic
    }

    pub(crate) fn state(self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Only valid with the scheduler lock held.
    pub(crate) fn set_state(self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn lock(self) -> SchedulerLock {
        std::mem::forget(self.scheduler_lock.lock());
        SchedulerLock { fiber: self }
    }

    /// Releases a lock that a suspending fiber handed over.
    ///
    /// # Safety
    /// The lock must be held and leaked, as `SchedulerLock::hand_over` leaves it.
    pub(crate) unsafe fn unlock_handed_over(self) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.scheduler_lock.force_unlock() };
    }

    pub(crate) fn is_scheduling_group_local(self) -> bool {
        self.scheduling_group_local
    }

    pub(crate) fn is_reactor(self) -> bool {
        self.reactor
    }

    pub(crate) fn home_worker(self) -> Option<usize> {
        match self.home_worker.load(Ordering::Relaxed) {
            usize::MAX => None,
            index => Some(index),
        }
    }

    pub(crate) fn group(self) -> &'static SchedulingGroup {
        // SAFETY: groups outlive every fiber they run; the runtime joins all
        // workers before dropping a group.
        unsafe { &*self.group.load(Ordering::Acquire) }
    }

    /// Makes a `from` fiber ready again. Anything else is a broken invariant.
    pub(crate) fn mark_ready(self, from: FiberState) {
        let _lock = self.lock();
        let state = self.state();
        if state != from {
            fatal!("fiber {:?} made ready while {:?}, expected {:?}", self, state, from);
        }
        self.set_state(FiberState::Ready);
        self.ready_since.store(monotonic_nanos(), Ordering::Relaxed);
    }

    /// Hands control back to master. Must be called on this fiber's own stack.
    pub(crate) fn switch_to_master(self, action: SwitchAction) {
        let yielder = self.yielder.get();
        if yielder.is_null() {
            fatal!("fiber {:?} switching to master while not running", self);
        }
        // SAFETY: the yielder lives on this fiber's stack frame for as long as
        // the coroutine body runs.
        unsafe { (*yielder).suspend(action) };
    }

    /// Resumes the coroutine until it switches away. Called by master only.
    pub(crate) fn run(self, group: &SchedulingGroup, worker_index: usize) -> Switched {
        {
            let _lock = self.lock();
            let state = self.state();
            if state != FiberState::Ready {
                fatal!("master resuming fiber {:?} in state {:?}", self, state);
            }
            self.set_state(FiberState::Running);
        }
        if self.magic != FIBER_MAGIC {
            fatal!("fiber {:?} has a corrupted header", self);
        }
        self.group.store(
            group as *const SchedulingGroup as *mut SchedulingGroup,
            Ordering::Release,
        );
        if self.scheduling_group_local && self.home_worker().is_none() {
            self.home_worker.store(worker_index, Ordering::Relaxed);
        }
        let waited = monotonic_nanos().saturating_sub(self.ready_since.load(Ordering::Relaxed));
        if waited > SCHEDULING_LATENCY_REPORT_NANOS {
            tracing::trace!(fiber = ?self, waited_us = waited / 1000, "fiber scheduled late");
        }

        let previous = set_current_fiber(Some(self));
        // SAFETY: only the master holding a `Running` fiber touches its coroutine.
        let result = match unsafe { (*self.coroutine.get()).as_mut() } {
            Some(coroutine) => coroutine.resume(()),
            None => fatal!("fiber {:?} has no coroutine", self),
        };
        set_current_fiber(previous);

        match result {
            CoroutineResult::Yield(action) => Switched::Action(action),
            CoroutineResult::Return(lock) => Switched::Exited(lock),
        }
    }

    /// Frees a fiber that has returned, giving its stack back to the pool.
    ///
    /// # Safety
    /// The coroutine must have completed and no other reference may be used
    /// afterwards.
    pub(crate) unsafe fn destroy(self) {
        {
            let _lock = self.lock();
            self.set_state(FiberState::Dead);
        }
        // SAFETY: created by `Box::leak` in `instantiate`.
        let entity = unsafe { Box::from_raw(self.0.as_ptr()) };
        let FiberEntity { coroutine, pool, .. } = *entity;
        if let Some(coroutine) = coroutine.into_inner() {
            pool.deallocate(coroutine.into_stack());
        }
    }
}
