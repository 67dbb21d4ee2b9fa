//! Per-group timer thread.
//!
//! Producers never touch the timer heap. Enabling a timer appends it to a
//! queue owned by the calling thread (one per thread and timer worker), and the
//! timer thread drains every producer queue into its private binary heap each
//! time it wakes. Producers only wake the timer thread when they lower the
//! earliest pending expiry, tracked in `next_expires_at`.

use crate::error::{Result, fatal};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

lazy_static::lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Nanoseconds since the process-wide monotonic epoch.
pub(crate) fn monotonic_nanos() -> u64 {
    instant_to_nanos(Instant::now())
}

pub(crate) fn instant_to_nanos(at: Instant) -> u64 {
    at.saturating_duration_since(*EPOCH).as_nanos() as u64
}

fn nanos_to_instant(nanos: u64) -> Instant {
    *EPOCH + Duration::from_nanos(nanos)
}

static NEXT_TIMER_WORKER_ID: AtomicUsize = AtomicUsize::new(0);

type Callback = Box<dyn FnMut() + Send + 'static>;

struct TimerEntry {
    worker: usize,
    expires_at: u64,
    interval: Option<u64>,
    cancelled: AtomicBool,
    enabled: AtomicBool,
    callback: Mutex<Callback>,
}

/// Handle to a timer created by [`SchedulingGroup::create_timer`].
///
/// Must be given back through `remove_timer` or `detach_timer`; dropping it
/// any other way is a fatal error.
///
/// [`SchedulingGroup::create_timer`]: crate::SchedulingGroup::create_timer
#[must_use = "a timer must be removed or detached"]
pub struct TimerId {
    entry: Option<Arc<TimerEntry>>,
}

impl TimerId {
    fn entry(&self) -> &Arc<TimerEntry> {
        match &self.entry {
            Some(entry) => entry,
            None => fatal!("timer handle used after release"),
        }
    }

    fn release(mut self) -> Arc<TimerEntry> {
        match self.entry.take() {
            Some(entry) => entry,
            None => fatal!("timer handle released twice"),
        }
    }
}

impl std::fmt::Debug for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ptr = self.entry.as_ref().map(Arc::as_ptr);
        f.debug_tuple("TimerId").field(&ptr).finish()
    }
}

impl Drop for TimerId {
    fn drop(&mut self) {
        if self.entry.is_some() && !thread::panicking() {
            fatal!("timer dropped without remove_timer or detach_timer");
        }
    }
}

struct Pending {
    expires_at: u64,
    seq: u64,
    entry: Arc<TimerEntry>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.expires_at == other.expires_at && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    // Reversed: BinaryHeap is a max-heap and we want the earliest expiry on top.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .expires_at
            .cmp(&self.expires_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Timers enabled by one producer thread, waiting to be moved into the heap.
#[derive(Default)]
struct ProducerQueue {
    timers: Mutex<Vec<Arc<TimerEntry>>>,
}

struct LocalQueueRef {
    worker: usize,
    owner: Weak<Shared>,
    queue: Arc<ProducerQueue>,
}

thread_local! {
    static PRODUCER_QUEUES: RefCell<Vec<LocalQueueRef>> = const { RefCell::new(Vec::new()) };
}

struct Shared {
    id: usize,
    producers: Mutex<Vec<Arc<ProducerQueue>>>,
    next_expires_at: AtomicU64,
    sleep_lock: Mutex<()>,
    sleep_cv: Condvar,
    stopped: AtomicBool,
    fired: AtomicU64,
}

/// Dedicated timer thread of a scheduling group.
pub(crate) struct TimerWorker {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerWorker {
    pub(crate) fn new() -> Self {
        TimerWorker {
            shared: Arc::new(Shared {
                id: NEXT_TIMER_WORKER_ID.fetch_add(1, Ordering::Relaxed),
                producers: Mutex::new(Vec::new()),
                next_expires_at: AtomicU64::new(u64::MAX),
                sleep_lock: Mutex::new(()),
                sleep_cv: Condvar::new(),
                stopped: AtomicBool::new(false),
                fired: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, name: String) -> Result<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || shared.run())?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    pub(crate) fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _guard = self.shared.sleep_lock.lock();
        self.shared.sleep_cv.notify_all();
    }

    pub(crate) fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!(timer_worker = self.shared.id, "timer thread panicked");
            }
        }
    }

    /// Creates an inert timer. Nothing fires until [`enable`](Self::enable).
    pub(crate) fn create<F>(&self, expires_at: Instant, interval: Option<Duration>, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let interval = interval.map(|i| (i.as_nanos() as u64).max(1));
        TimerId {
            entry: Some(Arc::new(TimerEntry {
                worker: self.shared.id,
                expires_at: instant_to_nanos(expires_at),
                interval,
                cancelled: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                callback: Mutex::new(Box::new(callback)),
            })),
        }
    }

    pub(crate) fn enable(&self, timer: &TimerId) {
        let entry = timer.entry();
        if entry.worker != self.shared.id {
            fatal!("timer enabled on a scheduling group other than its creator");
        }
        if entry.enabled.swap(true, Ordering::AcqRel) {
            fatal!("timer enabled twice");
        }
        self.shared.local_queue().timers.lock().push(entry.clone());

        let expires_at = entry.expires_at;
        let previous = self.shared.next_expires_at.fetch_min(expires_at, Ordering::AcqRel);
        if expires_at < previous {
            let _guard = self.shared.sleep_lock.lock();
            self.shared.sleep_cv.notify_one();
        }
    }

    /// Cancels the timer and releases the handle. A callback that is already
    /// running finishes, but a periodic timer never fires again.
    pub(crate) fn remove(&self, timer: TimerId) {
        timer.release().cancelled.store(true, Ordering::Release);
    }

    /// Releases the handle and lets the timer run its course.
    pub(crate) fn detach(&self, timer: TimerId) {
        drop(timer.release());
    }

    /// Callbacks invoked so far.
    pub(crate) fn fired(&self) -> u64 {
        self.shared.fired.load(Ordering::Relaxed)
    }
}

impl Shared {
    fn local_queue(self: &Arc<Self>) -> Arc<ProducerQueue> {
        PRODUCER_QUEUES.with(|queues| {
            let mut queues = queues.borrow_mut();
            queues.retain(|q| q.owner.strong_count() > 0);
            if let Some(q) = queues.iter().find(|q| q.worker == self.id) {
                return q.queue.clone();
            }
            let queue = Arc::new(ProducerQueue::default());
            self.producers.lock().push(queue.clone());
            queues.push(LocalQueueRef {
                worker: self.id,
                owner: Arc::downgrade(self),
                queue: queue.clone(),
            });
            queue
        })
    }

    fn run(&self) {
        tracing::debug!(timer_worker = self.id, "timer worker started");
        let mut heap = BinaryHeap::new();
        let mut seq = 0u64;
        loop {
            self.next_expires_at.store(u64::MAX, Ordering::SeqCst);
            self.collect(&mut heap, &mut seq);

            let now = monotonic_nanos();
            while heap.peek().is_some_and(|top: &Pending| top.expires_at <= now) {
                let Some(mut pending) = heap.pop() else { break };
                if pending.entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                self.fire(&pending.entry);
                if let Some(interval) = pending.entry.interval {
                    if !pending.entry.cancelled.load(Ordering::Acquire) {
                        pending.expires_at += interval;
                        heap.push(pending);
                    }
                }
            }

            if let Some(top) = heap.peek() {
                self.next_expires_at.fetch_min(top.expires_at, Ordering::SeqCst);
            }

            let mut guard = self.sleep_lock.lock();
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let next = self.next_expires_at.load(Ordering::SeqCst);
            if next == u64::MAX {
                self.sleep_cv.wait(&mut guard);
            } else {
                let deadline = nanos_to_instant(next);
                if deadline > Instant::now() {
                    self.sleep_cv.wait_until(&mut guard, deadline);
                }
            }
        }
        tracing::debug!(timer_worker = self.id, pending = heap.len(), "timer worker stopped");
    }

    fn collect(&self, heap: &mut BinaryHeap<Pending>, seq: &mut u64) {
        let mut producers = self.producers.lock();
        for queue in producers.iter() {
            for entry in queue.timers.lock().drain(..) {
                // Removed before it ever reached the heap.
                if entry.cancelled.load(Ordering::Acquire) {
                    continue;
                }
                *seq += 1;
                heap.push(Pending {
                    expires_at: entry.expires_at,
                    seq: *seq,
                    entry,
                });
            }
        }
        // Drop queues whose producer thread has exited.
        producers.retain(|q| Arc::strong_count(q) > 1 || !q.timers.lock().is_empty());
    }

    fn fire(&self, entry: &TimerEntry) {
        self.fired.fetch_add(1, Ordering::Relaxed);
        let mut callback = entry.callback.lock();
        if panic::catch_unwind(AssertUnwindSafe(|| (*callback)())).is_err() {
            tracing::error!(timer_worker = self.id, "timer callback panicked");
        }
    }
}
