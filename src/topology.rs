//! CPU and NUMA topology discovery.
//!
//! The CPU count comes from `sysinfo`. Node membership is read from
//! `/sys/devices/system/node` on Linux; anywhere else (or if sysfs is not
//! mounted) every CPU is reported on node 0.

use std::collections::BTreeMap;
use sysinfo::{CpuRefreshKind, System};

#[derive(Debug, Clone)]
pub struct Topology {
    pub core_to_node: BTreeMap<usize, usize>,
    pub node_cores: BTreeMap<usize, Vec<usize>>,
    pub num_nodes: usize,
}

impl Topology {
    pub fn detect() -> Self {
        let mut system = System::new();
        system.refresh_cpu_specifics(CpuRefreshKind::everything());
        let num_cpus = system.cpus().len().max(1);

        if let Some(nodes) = read_sysfs_nodes() {
            let topology = Self::from_nodes(nodes);
            if !topology.core_to_node.is_empty() {
                return topology;
            }
        }
        Self::uniform(num_cpus)
    }

    /// Every CPU on node 0.
    pub fn uniform(num_cpus: usize) -> Self {
        Self::from_nodes(BTreeMap::from([(0, (0..num_cpus).collect())]))
    }

    pub fn from_nodes(node_cores: BTreeMap<usize, Vec<usize>>) -> Self {
        let node_cores: BTreeMap<usize, Vec<usize>> = node_cores
            .into_iter()
            .filter(|(_, cores)| !cores.is_empty())
            .collect();
        let mut core_to_node = BTreeMap::new();
        for (&node, cores) in &node_cores {
            for &core in cores {
                core_to_node.insert(core, node);
            }
        }
        Topology {
            num_nodes: node_cores.len(),
            core_to_node,
            node_cores,
        }
    }

    pub fn node_of(&self, cpu: usize) -> usize {
        self.core_to_node.get(&cpu).copied().unwrap_or(0)
    }
}

/// The CPU the calling thread is running on, when the platform can tell.
pub fn current_cpu() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: sched_getcpu has no preconditions.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return Some(cpu as usize);
        }
    }
    None
}

/// Parses a kernel cpu list such as `0-3,8,10-11`.
pub fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().ok()?;
                let hi: usize = hi.trim().parse().ok()?;
                if lo > hi {
                    return None;
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    Some(cpus)
}

fn read_sysfs_nodes() -> Option<BTreeMap<usize, Vec<usize>>> {
    let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;
    let mut nodes = BTreeMap::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(id) = name
            .to_str()
            .and_then(|n| n.strip_prefix("node"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let list = std::fs::read_to_string(entry.path().join("cpulist")).ok()?;
        nodes.insert(id, parse_cpu_list(&list)?);
    }
    Some(nodes)
}
