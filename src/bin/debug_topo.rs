use fiberrt::runtime::plan_groups;
use fiberrt::topology::Topology;
use fiberrt::FiberConfig;

fn main() {
    let topo = Topology::detect();
    println!("Detected {} NUMA nodes", topo.num_nodes);
    println!("Core -> Node map: {:?}", topo.core_to_node);
    println!("Node -> Cores map: {:?}", topo.node_cores);

    for numa_aware in [false, true] {
        let config = FiberConfig {
            numa_aware,
            ..FiberConfig::default()
        };
        println!("\nGroup layout (numa_aware = {}):", numa_aware);
        for (id, plan) in plan_groups(&config, &topo).iter().enumerate() {
            println!(
                "  group {}: node {}, {} workers, cpus {:?}",
                id, plan.node_id, plan.workers, plan.affinity
            );
        }
    }
}
