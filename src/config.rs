//! Runtime configuration.
//!
//! Read once when the runtime starts. Every field has a default, so a partial
//! document (e.g. only `scheduling = "v2"`) deserializes into a usable config.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Upper bound on workers in one scheduling group (v1 tracks parked workers in a `u64` mask).
pub const MAX_WORKERS_PER_GROUP: usize = 64;

/// Configuration for the fiber runtime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiberConfig {
    /// Usable stack size of each fiber in bytes. Rounded up to the page size. Default: 128KB.
    pub stack_size: usize,
    /// Maximum number of stacks the pool will ever carve out. Beyond this, stacks
    /// come straight from the system allocator.
    pub stack_pool_limit: usize,
    /// Protect the lowest page of every stack.
    pub guard_page: bool,
    /// Capacity of the v1 run queue. Rounded up to a power of two.
    pub run_queue_capacity: usize,
    /// Capacity of each v2 per-worker queue; overflow spills to the group queue.
    pub local_queue_capacity: usize,
    /// Scheduling algorithm name, `"v1"` or `"v2"`.
    pub scheduling: String,
    /// Total number of fiber workers. 0 means one per available CPU.
    pub concurrency: usize,
    /// Fiber workers per scheduling group.
    pub workers_per_group: usize,
    /// CPUs workers are pinned to, round-robin. Empty disables pinning.
    pub cpu_affinity: Vec<usize>,
    /// Lay groups out per NUMA node and pin them to the node's CPUs.
    pub numa_aware: bool,
    /// Steal from a same-node group once every N attempts. 0 disables.
    pub work_stealing_ratio: u64,
    /// Steal from a group on another node once every N attempts. 0 disables.
    pub cross_numa_work_stealing_ratio: u64,
}

impl Default for FiberConfig {
    fn default() -> Self {
        Self {
            stack_size: 128 * 1024,
            stack_pool_limit: 16 * 1024,
            guard_page: true,
            run_queue_capacity: 65536,
            local_queue_capacity: 256,
            scheduling: "v1".to_string(),
            concurrency: 0,
            workers_per_group: 8,
            cpu_affinity: Vec::new(),
            numa_aware: false,
            work_stealing_ratio: 16,
            cross_numa_work_stealing_ratio: 0,
        }
    }
}

impl FiberConfig {
    /// Shorthand for a config with `concurrency` workers and defaults elsewhere.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }

    /// Resolves `concurrency = 0` to the number of available CPUs.
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency != 0 {
            return self.concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    /// Checks ranges and cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.stack_size < 16 * 1024 {
            return Err(Error::InvalidConfig(format!(
                "stack_size {} is below the 16KB minimum",
                self.stack_size
            )));
        }
        if self.workers_per_group == 0 || self.workers_per_group > MAX_WORKERS_PER_GROUP {
            return Err(Error::InvalidConfig(format!(
                "workers_per_group must be within 1..={}, got {}",
                MAX_WORKERS_PER_GROUP, self.workers_per_group
            )));
        }
        if self.run_queue_capacity == 0 || self.local_queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue capacities must be non-zero".into()));
        }
        if self.run_queue_capacity.checked_next_power_of_two().is_none() {
            return Err(Error::InvalidConfig(format!(
                "run_queue_capacity {} is too large",
                self.run_queue_capacity
            )));
        }
        if !crate::scheduling::is_registered(&self.scheduling) {
            return Err(Error::UnknownScheduling(self.scheduling.clone()));
        }
        Ok(())
    }
}
