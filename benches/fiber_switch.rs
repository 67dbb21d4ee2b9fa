//! Fiber switch latency benchmark using criterion.
//!
//! Measures the cost of the scheduler's switch paths on a single worker, so
//! every switch is a same-thread context switch with no stealing involved.

use criterion::{Criterion, criterion_group, criterion_main};
use fiberrt::sync::{ConditionVariable, Mutex};
use fiberrt::{Attributes, Fiber, FiberConfig, LaunchPolicy, Runtime, this_fiber};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn single_worker(scheduling: &str) -> Runtime {
    Runtime::start(FiberConfig {
        scheduling: scheduling.to_string(),
        concurrency: 1,
        ..FiberConfig::default()
    })
    .expect("runtime failed to start")
}

/// Runs `body` inside a fiber and returns the time it reports.
fn timed_in_fiber<F>(runtime: &Runtime, body: F) -> Duration
where
    F: FnOnce() -> Duration + Send + 'static,
{
    let nanos = Arc::new(AtomicU64::new(0));
    let out = nanos.clone();
    runtime
        .spawn(move || out.store(body().as_nanos() as u64, Ordering::SeqCst))
        .join();
    Duration::from_nanos(nanos.load(Ordering::SeqCst))
}

/// A lone fiber yielding: Fiber -> master -> same fiber.
fn bench_yield(c: &mut Criterion) {
    for scheduling in ["v1", "v2"] {
        let runtime = single_worker(scheduling);
        c.bench_function(&format!("yield_{}", scheduling), |b| {
            b.iter_custom(|iters| {
                timed_in_fiber(&runtime, move || {
                    let start = Instant::now();
                    for _ in 0..iters {
                        this_fiber::yield_now();
                    }
                    start.elapsed()
                })
            })
        });
        runtime.shutdown().expect("Shutdown failed");
    }
}

/// Two fibers handing a token back and forth through a condition variable.
fn bench_ping_pong(c: &mut Criterion) {
    let runtime = single_worker("v1");

    c.bench_function("condvar_ping_pong", |b| {
        b.iter_custom(|iters| {
            timed_in_fiber(&runtime, move || {
                let state = Arc::new((Mutex::new(0u64), ConditionVariable::new()));
                let peer_state = state.clone();
                let peer = Fiber::spawn(move || {
                    let (turn, cv) = &*peer_state;
                    for i in 0..iters {
                        let mut guard = cv.wait_while(turn.lock(), |t| *t != 2 * i + 1);
                        *guard += 1;
                        cv.notify_one();
                    }
                });

                let (turn, cv) = &*state;
                let start = Instant::now();
                for i in 0..iters {
                    *turn.lock() += 1;
                    cv.notify_one();
                    drop(cv.wait_while(turn.lock(), |t| *t != 2 * i + 2));
                }
                let elapsed = start.elapsed();
                peer.join();
                elapsed
            })
        })
    });

    runtime.shutdown().expect("Shutdown failed");
}

/// Spawn + run + join of an empty fiber from inside a fiber, both launch policies.
fn bench_spawn_join(c: &mut Criterion) {
    let runtime = single_worker("v1");

    for (name, policy) in [("spawn_join_post", LaunchPolicy::Post), ("spawn_join_dispatch", LaunchPolicy::Dispatch)] {
        c.bench_function(name, |b| {
            b.iter_custom(|iters| {
                timed_in_fiber(&runtime, move || {
                    let start = Instant::now();
                    for _ in 0..iters {
                        let attrs = Attributes::default().launch_policy(policy);
                        Fiber::spawn_with(attrs, || {
                            std::hint::black_box(42);
                        })
                        .join();
                    }
                    start.elapsed()
                })
            })
        });
    }

    runtime.shutdown().expect("Shutdown failed");
}

/// Cold path from a plain thread for comparison.
fn bench_runtime_cold(c: &mut Criterion) {
    let runtime = single_worker("v1");

    // Warmup
    for _ in 0..100 {
        runtime.spawn(|| {}).join();
    }

    c.bench_function("runtime_spawn_join_cold", |b| {
        b.iter(|| {
            runtime.spawn(std::hint::black_box(|| {})).join();
        })
    });

    runtime.shutdown().expect("Shutdown failed");
}

criterion_group!(
    benches,
    bench_yield,
    bench_ping_pong,
    bench_spawn_join,
    bench_runtime_cold
);
criterion_main!(benches);
