//! Wait queues shared by all fiber-aware primitives.
//!
//! A blocked waiter, either a fiber or a plain OS thread, owns a [`WaitBlock`] on its
//! own stack and links it into a primitive's [`Waitable`] while holding that
//! primitive's internal lock. Wakers pop blocks under the same lock, claim them
//! by flipping `satisfied`, and perform the actual wake-up only after
//! releasing it.

use crate::entity::{FiberPtr, current_fiber};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Counting wake-up slot for OS threads.
///
/// Wakes are never lost: each `wake` is consumed by exactly one `wait`. After
/// [`persistent_wake`](Self::persistent_wake) every wait returns immediately.
#[derive(Default)]
pub(crate) struct WaitSlot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

#[derive(Default)]
struct SlotState {
    wakeups: usize,
    persistent: bool,
}

impl WaitSlot {
    pub(crate) fn wake(&self) {
        let mut state = self.state.lock();
        state.wakeups += 1;
        self.cv.notify_one();
    }

    pub(crate) fn persistent_wake(&self) {
        let mut state = self.state.lock();
        state.persistent = true;
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut state = self.state.lock();
        while state.wakeups == 0 && !state.persistent {
            self.cv.wait(&mut state);
        }
        if !state.persistent {
            state.wakeups -= 1;
        }
    }

    /// Returns `false` if the deadline passed without a wake.
    pub(crate) fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        while state.wakeups == 0 && !state.persistent {
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.persistent {
            return true;
        }
        if state.wakeups == 0 {
            return false;
        }
        state.wakeups -= 1;
        true
    }
}

/// Who to wake for a wait block.
#[derive(Clone, Copy)]
pub(crate) enum Waiter {
    Fiber(FiberPtr),
    Thread(NonNull<WaitSlot>),
}

// SAFETY: the slot outlives its wait block and the block outlives any waker
// that claimed it (the waiter consumes the wake before returning).
unsafe impl Send for Waiter {}

impl Waiter {
    pub(crate) fn wake(self) {
        match self {
            Waiter::Fiber(fiber) => fiber.group().scheduling().resume(fiber),
            // SAFETY: see the `Send` impl above.
            Waiter::Thread(slot) => unsafe { slot.as_ref().wake() },
        }
    }
}

pub(crate) struct WaitBlock {
    waiter: Waiter,
    satisfied: AtomicBool,
}

impl WaitBlock {
    pub(crate) fn new(waiter: Waiter) -> Self {
        WaitBlock {
            waiter,
            satisfied: AtomicBool::new(false),
        }
    }

    /// Claims the block. Exactly one caller ever gets `true`.
    pub(crate) fn claim(&self) -> bool {
        !self.satisfied.swap(true, Ordering::AcqRel)
    }
}

/// FIFO of blocked waiters, always used under its owner's lock.
#[derive(Default)]
pub(crate) struct Waitable {
    waiters: VecDeque<NonNull<WaitBlock>>,
    persistent_awakened: bool,
}

// SAFETY: the raw blocks are only dereferenced under the owner's lock while
// their waiters are blocked.
unsafe impl Send for Waitable {}

impl Waitable {
    pub(crate) const fn new() -> Self {
        Waitable {
            waiters: VecDeque::new(),
            persistent_awakened: false,
        }
    }

    /// Queues `block`. Returns `false`, without queueing, once the waitable is
    /// persistently awakened.
    pub(crate) fn add_waiter(&mut self, block: &WaitBlock) -> bool {
        if self.persistent_awakened {
            return false;
        }
        self.waiters.push_back(NonNull::from(block));
        true
    }

    pub(crate) fn try_remove_waiter(&mut self, block: &WaitBlock) -> bool {
        let target = NonNull::from(block);
        match self.waiters.iter().position(|&w| w == target) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Pops the first waiter nobody else has claimed (timeouts claim too).
    pub(crate) fn wake_one(&mut self) -> Option<Waiter> {
        while let Some(block) = self.waiters.pop_front() {
            // SAFETY: queued blocks stay alive until removed or claimed.
            let block = unsafe { block.as_ref() };
            if block.claim() {
                return Some(block.waiter);
            }
        }
        None
    }

    pub(crate) fn wake_all(&mut self) -> Vec<Waiter> {
        let mut woken = Vec::with_capacity(self.waiters.len());
        while let Some(waiter) = self.wake_one() {
            woken.push(waiter);
        }
        woken
    }

    /// Wakes everyone and makes later `add_waiter` calls fail.
    pub(crate) fn set_persistent_awakened(&mut self) -> Vec<Waiter> {
        self.persistent_awakened = true;
        self.wake_all()
    }

    pub(crate) fn is_persistent_awakened(&self) -> bool {
        self.persistent_awakened
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// State shared between a timed fiber wait and its timeout callback.
struct TimeoutShared {
    /// Set once the waiter has moved on; the callback must then do nothing.
    waiter_gone: Mutex<bool>,
    timed_out: AtomicBool,
    block: NonNull<WaitBlock>,
}

// SAFETY: `block` is only dereferenced under `waiter_gone` while it is false,
// i.e. while the waiter is still blocked and its stack frame alive.
unsafe impl Send for TimeoutShared {}
unsafe impl Sync for TimeoutShared {}

/// Blocks the caller on the waitable selected by `project` out of `lock`.
///
/// `guard` must be a guard of `lock`. `after_queued` runs once the caller is
/// queued but before it blocks, while `guard` is still held; condition
/// variables release the user mutex there. Returns `false` on timeout, `true`
/// when woken (or when the waitable was already persistently awakened).
pub(crate) fn block_on<S>(
    lock: &Mutex<S>,
    guard: MutexGuard<'_, S>,
    project: fn(&mut S) -> &mut Waitable,
    deadline: Option<Instant>,
    after_queued: impl FnOnce(),
) -> bool {
    match current_fiber() {
        Some(fiber) => block_fiber(fiber, lock, guard, project, deadline, after_queued),
        None => block_thread(lock, guard, project, deadline, after_queued),
    }
}

fn block_fiber<S>(
    fiber: FiberPtr,
    lock: &Mutex<S>,
    mut guard: MutexGuard<'_, S>,
    project: fn(&mut S) -> &mut Waitable,
    deadline: Option<Instant>,
    after_queued: impl FnOnce(),
) -> bool {
    let block = WaitBlock::new(Waiter::Fiber(fiber));
    let scheduler_lock = fiber.lock();
    if !project(&mut guard).add_waiter(&block) {
        drop(scheduler_lock);
        after_queued();
        return true;
    }

    let group = fiber.group();
    let timeout = deadline.map(|deadline| {
        let shared = Arc::new(TimeoutShared {
            waiter_gone: Mutex::new(false),
            timed_out: AtomicBool::new(false),
            block: NonNull::from(&block),
        });
        let callback_shared = shared.clone();
        let timer = group.create_timer(deadline, move || {
            let gone = callback_shared.waiter_gone.lock();
            if *gone {
                return;
            }
            // SAFETY: the waiter is still blocked, see `TimeoutShared`.
            let block = unsafe { callback_shared.block.as_ref() };
            if block.claim() {
                callback_shared.timed_out.store(true, Ordering::Release);
                let waiter = block.waiter;
                drop(gone);
                waiter.wake();
            }
        });
        group.enable_timer(&timer);
        (shared, timer)
    });

    after_queued();
    drop(guard);
    group.scheduling().suspend(fiber, scheduler_lock);

    let Some((shared, timer)) = timeout else {
        return true;
    };
    *shared.waiter_gone.lock() = true;
    group.remove_timer(timer);
    if shared.timed_out.load(Ordering::Acquire) {
        project(&mut lock.lock()).try_remove_waiter(&block);
        return false;
    }
    true
}

fn block_thread<S>(
    lock: &Mutex<S>,
    mut guard: MutexGuard<'_, S>,
    project: fn(&mut S) -> &mut Waitable,
    deadline: Option<Instant>,
    after_queued: impl FnOnce(),
) -> bool {
    let slot = WaitSlot::default();
    let block = WaitBlock::new(Waiter::Thread(NonNull::from(&slot)));
    if !project(&mut guard).add_waiter(&block) {
        after_queued();
        return true;
    }
    after_queued();
    drop(guard);

    let Some(deadline) = deadline else {
        slot.wait();
        return true;
    };
    if slot.wait_until(deadline) {
        return true;
    }
    // Timed out. Either withdraw the block or, if a waker already claimed it,
    // consume the wake that is on its way so the slot is not freed under it.
    let mut guard = lock.lock();
    if block.claim() {
        project(&mut guard).try_remove_waiter(&block);
        return false;
    }
    drop(guard);
    slot.wait();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_slot_counts_wakes() {
        let slot = WaitSlot::default();
        slot.wake();
        slot.wake();
        slot.wait();
        slot.wait();
        assert!(!slot.wait_until(Instant::now() + Duration::from_millis(10)));
    }

    #[test]
    fn test_persistent_wake_releases_everyone() {
        let slot = Arc::new(WaitSlot::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                thread::spawn(move || slot.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        slot.persistent_wake();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(slot.wait_until(Instant::now()));
    }

    #[test]
    fn test_wake_one_skips_claimed_blocks() {
        let slot = WaitSlot::default();
        let first = WaitBlock::new(Waiter::Thread(NonNull::from(&slot)));
        let second = WaitBlock::new(Waiter::Thread(NonNull::from(&slot)));
        let mut waitable = Waitable::new();
        assert!(waitable.add_waiter(&first));
        assert!(waitable.add_waiter(&second));
        assert!(first.claim());
        assert!(waitable.wake_one().is_some());
        assert!(!second.claim());
        assert!(waitable.is_empty());
    }

    #[test]
    fn test_persistent_awakened_rejects_waiters() {
        let slot = WaitSlot::default();
        let block = WaitBlock::new(Waiter::Thread(NonNull::from(&slot)));
        let mut waitable = Waitable::new();
        assert!(waitable.set_persistent_awakened().is_empty());
        assert!(waitable.is_persistent_awakened());
        assert!(!waitable.add_waiter(&block));
    }

    #[test]
    fn test_thread_wait_times_out() {
        let lock = Mutex::new(Waitable::new());
        let start = Instant::now();
        let woken = block_on(
            &lock,
            lock.lock(),
            |w| w,
            Some(start + Duration::from_millis(20)),
            || {},
        );
        assert!(!woken);
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(lock.lock().is_empty());
    }

    #[test]
    fn test_thread_wait_is_woken() {
        let lock = Arc::new(Mutex::new(Waitable::new()));
        let waker = lock.clone();
        let handle = thread::spawn(move || loop {
            let waiter = waker.lock().wake_one();
            match waiter {
                Some(waiter) => break waiter.wake(),
                None => thread::sleep(Duration::from_millis(1)),
            }
        });
        assert!(block_on(&lock, lock.lock(), |w| w, None, || {}));
        handle.join().unwrap();
    }
}
