use fiberrt::sync::{ConditionVariable, Event, Mutex};
use fiberrt::{Attributes, Fiber, FiberConfig, Placement, Runtime, SchedulingGroup, this_fiber};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

fn runtime(scheduling: &str, concurrency: usize) -> Runtime {
    Runtime::start(FiberConfig {
        scheduling: scheduling.to_string(),
        concurrency,
        stack_size: 64 * 1024,
        ..FiberConfig::default()
    })
    .expect("runtime failed to start")
}

fn wait_until(deadline: Duration, done: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn test_many_fibers_all_run() {
    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling, 4);
        let counter = Arc::new(AtomicUsize::new(0));

        let fibers: Vec<_> = (0..10_000)
            .map(|_| {
                let counter = counter.clone();
                runtime.spawn(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for fiber in fibers {
            fiber.join();
        }

        assert_eq!(counter.load(Ordering::Relaxed), 10_000, "{} lost fibers", scheduling);
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_batch_start_detached() {
    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling, 4);
        let counter = Arc::new(AtomicUsize::new(0));

        runtime.batch_start_detached((0..1000).map(|_| {
            let counter = counter.clone();
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }));

        assert!(
            wait_until(Duration::from_secs(10), || counter.load(Ordering::Relaxed) == 1000),
            "batch did not finish on {}",
            scheduling
        );
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_yielding_fibers_interleave() {
    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling, 2);
        let steps = Arc::new(AtomicUsize::new(0));

        let fibers: Vec<_> = (0..8)
            .map(|_| {
                let steps = steps.clone();
                runtime.spawn(move || {
                    for _ in 0..100 {
                        steps.fetch_add(1, Ordering::Relaxed);
                        this_fiber::yield_now();
                    }
                })
            })
            .collect();
        for fiber in fibers {
            fiber.join();
        }

        assert_eq!(steps.load(Ordering::Relaxed), 800);
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_suspend_and_resume_from_thread() {
    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling, 2);
        let event = Arc::new(Event::new());
        let resumed = Arc::new(AtomicBool::new(false));

        let fiber = {
            let event = event.clone();
            let resumed = resumed.clone();
            runtime.spawn(move || {
                event.wait();
                resumed.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        assert!(!resumed.load(Ordering::SeqCst), "fiber ran past an unset event");

        event.set();
        fiber.join();
        assert!(resumed.load(Ordering::SeqCst));
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_wakeups_racing_suspension_are_not_lost() {
    const FIBERS: usize = 200;
    const ROUNDS: u64 = 50;

    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling, 4);
        let states: Vec<_> = (0..FIBERS)
            .map(|_| Arc::new((Mutex::new(0u64), ConditionVariable::new())))
            .collect();
        let acked = Arc::new(AtomicUsize::new(0));

        let fibers: Vec<_> = states
            .iter()
            .map(|state| {
                let state = state.clone();
                let acked = acked.clone();
                runtime.spawn(move || {
                    let (round, cv) = &*state;
                    for expected in 1..=ROUNDS {
                        drop(cv.wait_while(round.lock(), |seen| *seen < expected));
                        acked.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        // No pacing: notifications land while fibers are still suspending.
        for next in 1..=ROUNDS {
            for state in &states {
                let (round, cv) = &**state;
                *round.lock() = next;
                cv.notify_one();
            }
        }

        assert!(
            wait_until(Duration::from_secs(20), || {
                acked.load(Ordering::Relaxed) == FIBERS * ROUNDS as usize
            }),
            "lost a wakeup on {}: {} of {}",
            scheduling,
            acked.load(Ordering::Relaxed),
            FIBERS * ROUNDS as usize
        );
        for fiber in fibers {
            fiber.join();
        }
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_yielding_reactor_fiber_does_not_starve_others() {
    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling, 1);
        let normal_ran = Arc::new(AtomicBool::new(false));

        let reactor = {
            let normal_ran = normal_ran.clone();
            runtime.spawn_with(Attributes::default().reactor(true), move || {
                let start = Instant::now();
                while !normal_ran.load(Ordering::SeqCst) && start.elapsed() < Duration::from_secs(5) {
                    this_fiber::yield_now();
                }
            })
        };
        let flag = normal_ran.clone();
        runtime.start_detached(move || flag.store(true, Ordering::SeqCst));

        reactor.join();
        assert!(normal_ran.load(Ordering::SeqCst), "reactor fiber starved the worker on {}", scheduling);
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_yielding_fiber_does_not_starve_local_peers() {
    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling, 1);
        let finished = Arc::new(AtomicUsize::new(0));

        let done = finished.clone();
        runtime
            .spawn(move || {
                // Children land on this worker's own queue.
                for _ in 0..10 {
                    let done = done.clone();
                    fiberrt::start_detached(move || {
                        done.fetch_add(1, Ordering::SeqCst);
                    });
                }
                let start = Instant::now();
                while done.load(Ordering::SeqCst) < 10 && start.elapsed() < Duration::from_secs(5) {
                    this_fiber::yield_now();
                }
            })
            .join();

        assert_eq!(finished.load(Ordering::SeqCst), 10, "yielder starved its peers on {}", scheduling);
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_yielding_fiber_migrates_between_workers() {
    let runtime = runtime("v2", 2);
    let release = Arc::new(AtomicBool::new(false));
    let workers = Arc::new(StdMutex::new(HashSet::new()));

    // Hold one worker busy so the yielder's home is taken every other turn.
    let blocker = {
        let release = release.clone();
        runtime.spawn(move || {
            while !release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_micros(200));
                this_fiber::yield_now();
            }
        })
    };
    let yielder = {
        let workers = workers.clone();
        runtime.spawn(move || {
            let start = Instant::now();
            loop {
                let seen = {
                    let mut workers = workers.lock().unwrap();
                    workers.insert(std::thread::current().id());
                    workers.len()
                };
                if seen == 2 || start.elapsed() > Duration::from_secs(5) {
                    break;
                }
                this_fiber::yield_now();
            }
        })
    };

    yielder.join();
    release.store(true, Ordering::SeqCst);
    blocker.join();
    assert_eq!(workers.lock().unwrap().len(), 2, "yielded fiber never left its worker");
    runtime.shutdown().expect("Shutdown failed");
}

#[test]
fn test_thread_waits_for_fiber_event() {
    let runtime = runtime("v2", 2);
    let event = Arc::new(Event::new());
    let setter = event.clone();

    runtime.start_detached(move || {
        this_fiber::sleep_for(Duration::from_millis(10));
        setter.set();
    });

    assert!(event.wait_for(Duration::from_secs(5)));
    assert!(event.is_set());
    runtime.shutdown().expect("Shutdown failed");
}

#[test]
fn test_blocked_fibers_release_workers() {
    // One worker, many fibers blocked on the same event: if blocking pinned
    // the worker, the setter would never run.
    let runtime = runtime("v1", 1);
    let event = Arc::new(Event::new());
    let woken = Arc::new(AtomicUsize::new(0));

    let waiters: Vec<_> = (0..50)
        .map(|_| {
            let event = event.clone();
            let woken = woken.clone();
            runtime.spawn(move || {
                event.wait();
                woken.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    let setter = event.clone();
    runtime
        .spawn(move || {
            this_fiber::sleep_for(Duration::from_millis(5));
            setter.set();
        })
        .join();

    for waiter in waiters {
        waiter.join();
    }
    assert_eq!(woken.load(Ordering::SeqCst), 50);
    runtime.shutdown().expect("Shutdown failed");
}

#[test]
fn test_random_sleeps() {
    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling, 4);
        let done = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        let fibers: Vec<_> = (0..1000)
            .map(|_| {
                let done = done.clone();
                let millis = rand::rng().random_range(0..=10);
                runtime.spawn(move || {
                    this_fiber::sleep_for(Duration::from_millis(millis));
                    done.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for fiber in fibers {
            fiber.join();
        }

        assert_eq!(done.load(Ordering::Relaxed), 1000);
        // Sleeping fibers overlap; serialized they would need seconds.
        assert!(start.elapsed() < Duration::from_secs(5));
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_foreign_group_steals_when_home_is_busy() {
    for scheduling in ["v1", "v2"] {
        let runtime = Runtime::start(FiberConfig {
            scheduling: scheduling.to_string(),
            concurrency: 2,
            workers_per_group: 1,
            work_stealing_ratio: 1,
            stack_size: 64 * 1024,
            ..FiberConfig::default()
        })
        .expect("runtime failed to start");
        assert_eq!(runtime.group_count(), 2);

        let home = Attributes::default().placement(Placement::Group(0));
        let release = Arc::new(AtomicBool::new(false));
        let blocker_group = Arc::new(AtomicUsize::new(usize::MAX));
        let blocker = {
            let release = release.clone();
            let blocker_group = blocker_group.clone();
            runtime.spawn_with(home.clone(), move || {
                let group = SchedulingGroup::current().expect("not on a worker");
                blocker_group.store(group.id(), Ordering::SeqCst);
                // Hold the worker without suspending.
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };
        assert!(wait_until(Duration::from_secs(5), || {
            blocker_group.load(Ordering::SeqCst) != usize::MAX
        }));

        let ran_on = Arc::new(StdMutex::new(HashSet::new()));
        let fibers: Vec<_> = (0..20)
            .map(|_| {
                let ran_on = ran_on.clone();
                runtime.spawn_with(home.clone(), move || {
                    let group = SchedulingGroup::current().expect("not on a worker");
                    ran_on.lock().unwrap().insert(group.id());
                })
            })
            .collect();

        // While one worker is held, the other must pick up group 0's fibers.
        let progressed = wait_until(Duration::from_secs(5), || !ran_on.lock().unwrap().is_empty());
        release.store(true, Ordering::SeqCst);
        blocker.join();
        for fiber in fibers {
            fiber.join();
        }

        assert!(progressed, "fibers starved behind a busy worker on {}", scheduling);
        let stolen = blocker_group.load(Ordering::SeqCst) == 1 || ran_on.lock().unwrap().contains(&1);
        assert!(stolen, "group 1 never stole from group 0 on {}", scheduling);
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_group_local_fibers_stay_home() {
    for scheduling in ["v1", "v2"] {
        let runtime = Runtime::start(FiberConfig {
            scheduling: scheduling.to_string(),
            concurrency: 4,
            workers_per_group: 2,
            work_stealing_ratio: 1,
            stack_size: 64 * 1024,
            ..FiberConfig::default()
        })
        .expect("runtime failed to start");

        let attrs = Attributes::default()
            .placement(Placement::Group(0))
            .scheduling_group_local(true);
        let foreign = Arc::new(AtomicUsize::new(0));
        let fibers: Vec<_> = (0..200)
            .map(|_| {
                let foreign = foreign.clone();
                runtime.spawn_with(attrs.clone(), move || {
                    for _ in 0..3 {
                        let group = SchedulingGroup::current().expect("not on a worker");
                        if group.id() != 0 {
                            foreign.fetch_add(1, Ordering::SeqCst);
                        }
                        this_fiber::yield_now();
                    }
                })
            })
            .collect();
        for fiber in fibers {
            fiber.join();
        }

        assert_eq!(foreign.load(Ordering::SeqCst), 0, "{} leaked local fibers", scheduling);
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_fiber_spawned_from_fiber_uses_same_runtime() {
    let runtime = runtime("v2", 2);
    let depth = Arc::new(AtomicUsize::new(0));

    fn recurse(level: usize, depth: Arc<AtomicUsize>) {
        depth.fetch_max(level, Ordering::SeqCst);
        if level < 32 {
            Fiber::spawn(move || recurse(level + 1, depth)).join();
        }
    }

    let d = depth.clone();
    runtime.spawn(move || recurse(0, d)).join();
    assert_eq!(depth.load(Ordering::SeqCst), 32);
    assert_eq!(runtime.live_fibers(), 0);
    runtime.shutdown().expect("Shutdown failed");
}
