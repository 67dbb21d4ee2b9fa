use fiberrt::sync::{ConditionVariable, Mutex};
use fiberrt::{FiberConfig, Runtime, this_fiber};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn main() {
    println!("fiberrt - M:N Fiber Runtime\n");

    let scheduling = std::env::args().nth(1).unwrap_or_else(|| "v1".to_string());
    let config = FiberConfig {
        concurrency: 4,
        scheduling,
        ..FiberConfig::default()
    };
    let runtime = match Runtime::start(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    println!(
        "Started {} workers in {} scheduling groups ({})\n",
        runtime.worker_count(),
        runtime.group_count(),
        runtime.config().scheduling
    );

    // Example 1: Simple fiber
    println!("Example 1: Spawn and join");
    runtime.spawn(|| println!("  Hello from a fiber!")).join();
    println!("  Fiber completed\n");

    // Example 2: Many fibers sharing a fiber mutex
    println!("Example 2: Parallel computation");
    let sum = Arc::new(Mutex::new(0usize));
    let num_fibers = 100;
    let start = Instant::now();
    let fibers: Vec<_> = (0..num_fibers)
        .map(|i| {
            let sum = sum.clone();
            runtime.spawn(move || {
                this_fiber::yield_now();
                *sum.lock() += i;
            })
        })
        .collect();
    for fiber in fibers {
        fiber.join();
    }
    let expected_sum: usize = (0..num_fibers).sum();
    println!("  Executed {} fibers in {:?}", num_fibers, start.elapsed());
    println!("  Sum result: {} (expected: {})\n", *sum.lock(), expected_sum);

    // Example 3: Sleeping fibers don't block workers
    println!("Example 3: 1000 sleeping fibers");
    let start = Instant::now();
    let fibers: Vec<_> = (0..1000u64)
        .map(|i| runtime.spawn(move || this_fiber::sleep_for(Duration::from_millis(i % 10))))
        .collect();
    for fiber in fibers {
        fiber.join();
    }
    println!("  All woke up after {:?}\n", start.elapsed());

    // Example 4: Producer / consumer over a condition variable
    println!("Example 4: Producer / consumer");
    let queue = Arc::new((Mutex::new(Vec::new()), ConditionVariable::new()));
    let consumed = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let queue = queue.clone();
        let consumed = consumed.clone();
        runtime.spawn(move || {
            let (items, cv) = &*queue;
            while consumed.load(Ordering::SeqCst) < 1000 {
                let mut guard = cv.wait_while(items.lock(), |items: &mut Vec<usize>| items.is_empty());
                consumed.fetch_add(guard.drain(..).count(), Ordering::SeqCst);
            }
        })
    };
    for chunk in 0..10 {
        let queue = queue.clone();
        runtime.start_detached(move || {
            let (items, cv) = &*queue;
            for i in 0..100 {
                items.lock().push(chunk * 100 + i);
                cv.notify_one();
            }
        });
    }
    consumer.join();
    println!("  Consumed {} items\n", consumed.load(Ordering::SeqCst));

    // Example 5: High-throughput batch start
    println!("Example 5: High-throughput benchmark");
    let num_fibers = 10000;
    let done = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    runtime.batch_start_detached((0..num_fibers).map(|_| {
        let done = done.clone();
        move || {
            done.fetch_add(1, Ordering::Relaxed);
        }
    }));
    while done.load(Ordering::Relaxed) < num_fibers {
        std::thread::sleep(Duration::from_micros(100));
    }
    let duration = start.elapsed();
    println!("  Executed {} fibers in {:?}", num_fibers, duration);
    println!(
        "  Throughput: {:.2} fibers/second\n",
        num_fibers as f64 / duration.as_secs_f64()
    );

    println!("Shutting down runtime...");
    match runtime.shutdown() {
        Ok(()) => println!("Done!"),
        Err(e) => eprintln!("Shutdown error: {}", e),
    }
}
