//! # fiberrt - M:N Fiber Runtime
//!
//! A fiber runtime that multiplexes many lightweight, stackful user-space
//! threads (fibers) onto a small pool of OS worker threads.
//!
//! ## Architecture
//!
//! - **Fibers**: stackful coroutines with their own pooled stacks. Blocking a
//!   fiber suspends it and frees its worker for other fibers.
//! - **Scheduling groups**: sets of workers sharing run queues and a timer
//!   thread, usually one per NUMA node. Idle groups steal from each other.
//! - **Scheduling algorithms**: `v1` (one shared run queue per group) and `v2`
//!   (per-worker work-stealing deques), selected by name in [`FiberConfig`].
//! - **Synchronization**: [`sync::Mutex`], [`sync::ConditionVariable`],
//!   [`sync::Event`] and friends work from fibers and plain threads alike.
//!
//! ## Example
//!
//! ```no_run
//! use fiberrt::{Runtime, sync::Mutex};
//! use std::sync::Arc;
//!
//! let runtime = Runtime::new(4).unwrap();
//! let total = Arc::new(Mutex::new(0));
//!
//! let fibers: Vec<_> = (0..100)
//!     .map(|i| {
//!         let total = total.clone();
//!         runtime.spawn(move || *total.lock() += i)
//!     })
//!     .collect();
//! for fiber in fibers {
//!     fiber.join();
//! }
//! assert_eq!(*total.lock(), 4950);
//! runtime.shutdown().unwrap();
//! ```

pub mod allocator;
pub mod config;
pub(crate) mod descriptor;
pub(crate) mod entity;
pub mod error;
pub mod fiber;
pub mod group;
pub mod runtime;
pub(crate) mod scheduling;
pub mod sync;
pub mod this_fiber;
pub mod timer;
pub mod topology;
pub(crate) mod worker;

pub use allocator::StackPool;
pub use config::FiberConfig;
pub use error::{Error, Result};
pub use fiber::{Attributes, Fiber, LaunchPolicy, Placement, batch_start_detached, start_detached};
pub use group::SchedulingGroup;
pub use runtime::Runtime;
pub use timer::TimerId;
pub use topology::Topology;
