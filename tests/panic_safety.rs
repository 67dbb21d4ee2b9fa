use fiberrt::sync::Mutex;
use fiberrt::{FiberConfig, Runtime};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn runtime(scheduling: &str) -> Runtime {
    Runtime::start(FiberConfig {
        scheduling: scheduling.to_string(),
        concurrency: 1,
        stack_size: 64 * 1024,
        ..FiberConfig::default()
    })
    .expect("runtime failed to start")
}

#[test]
fn test_panicking_fiber_still_joins() {
    for scheduling in ["v1", "v2"] {
        let runtime = runtime(scheduling);

        // join returns even though the fiber body panicked
        runtime.spawn(|| panic!("Intentional panic for testing")).join();

        assert_eq!(runtime.live_fibers(), 0, "panicked fiber still counted as live");
        assert_eq!(runtime.stack_pool().outstanding(), 0, "panicked fiber leaked its stack");
        runtime.shutdown().expect("Shutdown failed");
    }
}

#[test]
fn test_worker_recovery_after_panic() {
    let runtime = runtime("v1");

    // 1. Panicking fiber
    runtime.spawn(|| panic!("Boom")).join();

    // 2. Normal fiber on the same (only) worker
    let success = Arc::new(AtomicBool::new(false));
    let success_clone = success.clone();
    runtime
        .spawn(move || {
            success_clone.store(true, Ordering::SeqCst);
        })
        .join();

    assert!(success.load(Ordering::SeqCst), "Subsequent fiber failed to run");
    runtime.shutdown().expect("Shutdown failed");
}

#[test]
fn test_many_panics_do_not_starve_others() {
    let runtime = runtime("v2");
    let completed = Arc::new(AtomicUsize::new(0));

    let fibers: Vec<_> = (0..100)
        .map(|i| {
            let completed = completed.clone();
            runtime.spawn(move || {
                if i % 2 == 0 {
                    panic!("fiber {} panicked", i);
                }
                completed.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    for fiber in fibers {
        fiber.join();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 50);
    runtime.shutdown().expect("Shutdown failed");
}

#[test]
fn test_mutex_released_when_holder_panics() {
    let runtime = runtime("v1");
    let mutex = Arc::new(Mutex::new(0u32));

    let m = mutex.clone();
    runtime
        .spawn(move || {
            let mut guard = m.lock();
            *guard += 1;
            panic!("panic while holding the lock");
        })
        .join();

    let acquired = Arc::new(AtomicBool::new(false));
    let (m, a) = (mutex.clone(), acquired.clone());
    runtime
        .spawn(move || {
            let guard = m.lock();
            a.store(*guard == 1, Ordering::SeqCst);
        })
        .join();

    assert!(acquired.load(Ordering::SeqCst));
    assert!(mutex.try_lock().is_some());
    runtime.shutdown().expect("Shutdown failed");
}

#[test]
fn test_panic_after_suspension() {
    let runtime = runtime("v2");
    runtime
        .spawn(|| {
            fiberrt::this_fiber::sleep_for(Duration::from_millis(5));
            panic!("panic on a resumed fiber");
        })
        .join();
    assert_eq!(runtime.live_fibers(), 0);
    runtime.shutdown().expect("Shutdown failed");
}
