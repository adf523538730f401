//! Resource accounting for drain feasibility
//!
//! Decides whether the workload of an outdated node fits onto the currently
//! ready updated nodes. This is a sum-of-capacities test, not a bin-pack:
//! two targets with 1 GiB free each are deemed able to take a single 2 GiB
//! pod. The cluster autoscaler's own pending-pod logic compensates by
//! adding capacity when the scheduler disagrees.
//!
//! CPU is accounted in millicores, memory in bytes, on both sides of the
//! comparison.

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::warn;

use crate::k8s::{node_name, ClusterClient};

/// CPU request/allocatable in millicores; unparseable values count as zero
pub fn cpu_millis(quantity: &Quantity) -> i64 {
    parse_quantity(&quantity.0).map_or(0, |value| (value * 1000.0).round() as i64)
}

/// Memory request/allocatable in bytes; unparseable values count as zero
pub fn memory_bytes(quantity: &Quantity) -> i64 {
    parse_quantity(&quantity.0).map_or(0, |value| value.round() as i64)
}

/// Parse a Kubernetes quantity string into an unscaled value
///
/// Handles plain and decimal numbers, the `m` milli suffix, decimal SI
/// suffixes (`k`, `M`, `G`, ...) and binary suffixes (`Ki`, `Mi`, `Gi`, ...).
fn parse_quantity(value: &str) -> Option<f64> {
    let value = value.trim();
    let split = value
        .find(|ch: char| ch.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => (1u64 << 10) as f64,
        "Mi" => (1u64 << 20) as f64,
        "Gi" => (1u64 << 30) as f64,
        "Ti" => (1u64 << 40) as f64,
        "Pi" => (1u64 << 50) as f64,
        "Ei" => (1u64 << 60) as f64,
        _ => return None,
    };
    Some(number * multiplier)
}

/// Summed CPU (millicores) and memory (bytes) requests of a pod's containers
fn pod_requests(pod: &Pod) -> (i64, i64) {
    let mut cpu = 0;
    let mut memory = 0;
    if let Some(spec) = pod.spec.as_ref() {
        for container in &spec.containers {
            if let Some(requests) = container
                .resources
                .as_ref()
                .and_then(|resources| resources.requests.as_ref())
            {
                cpu += requests.get("cpu").map_or(0, cpu_millis);
                memory += requests.get("memory").map_or(0, memory_bytes);
            }
        }
    }
    (cpu, memory)
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status
            .as_ref()
            .and_then(|status| status.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_daemon_set_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.kind == "DaemonSet"))
}

fn allocatable(node: &Node) -> (i64, i64) {
    node.status
        .as_ref()
        .and_then(|status| status.allocatable.as_ref())
        .map_or((0, 0), |allocatable| {
            (
                allocatable.get("cpu").map_or(0, cpu_millis),
                allocatable.get("memory").map_or(0, memory_bytes),
            )
        })
}

/// Whether the target nodes' aggregate free capacity can absorb the
/// outdated node's non-DaemonSet workload
///
/// DaemonSet pods re-spawn on the targets regardless, so they are excluded
/// from demand; terminal pods consume nothing on either side. A failed pod
/// listing on the outdated node assumes feasibility so a transient list
/// error cannot stall the rollout; a failed listing on a target removes
/// that target's contribution instead.
pub async fn has_enough_capacity_for(
    cluster: &dyn ClusterClient,
    outdated_node: &Node,
    target_nodes: &[Node],
) -> bool {
    let mut supply_cpu = 0;
    let mut supply_memory = 0;
    for target in target_nodes {
        let (allocatable_cpu, allocatable_memory) = allocatable(target);
        let pods = match cluster.get_pods_in_node(node_name(target)).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(node = %node_name(target), error = %e, "unable to list pods on target node, not counting it");
                continue;
            }
        };
        let mut free_cpu = allocatable_cpu;
        let mut free_memory = allocatable_memory;
        for pod in pods.iter().filter(|pod| !is_terminal(pod)) {
            let (cpu, memory) = pod_requests(pod);
            free_cpu -= cpu;
            free_memory -= memory;
        }
        supply_cpu += free_cpu;
        supply_memory += free_memory;
    }

    let pods = match cluster.get_pods_in_node(node_name(outdated_node)).await {
        Ok(pods) => pods,
        Err(e) => {
            warn!(node = %node_name(outdated_node), error = %e, "unable to determine resources needed, assuming enough are available");
            return true;
        }
    };
    let mut demand_cpu = 0;
    let mut demand_memory = 0;
    for pod in pods
        .iter()
        .filter(|pod| !is_terminal(pod) && !is_daemon_set_pod(pod))
    {
        let (cpu, memory) = pod_requests(pod);
        demand_cpu += cpu;
        demand_memory += memory;
    }

    supply_cpu >= demand_cpu && supply_memory >= demand_memory
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Container, NodeStatus, PodSpec, PodStatus, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use crate::k8s::DrainOptions;
    use crate::Result;

    struct PodLister {
        pods: HashMap<String, Vec<Pod>>,
        fail_for: Vec<String>,
    }

    #[async_trait]
    impl ClusterClient for PodLister {
        async fn get_nodes(&self) -> Result<Vec<Node>> {
            Ok(Vec::new())
        }

        async fn get_pods_in_node(&self, node_name: &str) -> Result<Vec<Pod>> {
            if self.fail_for.iter().any(|name| name == node_name) {
                return Err(crate::error::Error::cloud("listing failed"));
            }
            Ok(self.pods.get(node_name).cloned().unwrap_or_default())
        }

        async fn update_node(&self, _node: &Node) -> Result<()> {
            Ok(())
        }

        async fn cordon(&self, _node_name: &str) -> Result<()> {
            Ok(())
        }

        async fn drain(&self, _node_name: &str, _options: DrainOptions) -> Result<()> {
            Ok(())
        }
    }

    fn node(name: &str, cpu: &str, memory: &str) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.status = Some(NodeStatus {
            allocatable: Some(
                [
                    ("cpu".to_string(), Quantity(cpu.to_string())),
                    ("memory".to_string(), Quantity(memory.to_string())),
                ]
                .into(),
            ),
            ..Default::default()
        });
        node
    }

    fn pod(name: &str, node_name: &str, cpu: &str, memory: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.spec = Some(PodSpec {
            node_name: Some(node_name.to_string()),
            containers: vec![Container {
                name: name.to_string(),
                resources: Some(ResourceRequirements {
                    requests: Some(
                        [
                            ("cpu".to_string(), Quantity(cpu.to_string())),
                            ("memory".to_string(), Quantity(memory.to_string())),
                        ]
                        .into(),
                    ),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        });
        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        });
        pod
    }

    fn daemon_set_pod(name: &str, node_name: &str, cpu: &str, memory: &str) -> Pod {
        let mut pod = pod(name, node_name, cpu, memory);
        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "DaemonSet".to_string(),
            ..Default::default()
        }]);
        pod
    }

    fn lister(pods: Vec<Pod>) -> PodLister {
        let mut by_node: HashMap<String, Vec<Pod>> = HashMap::new();
        for pod in pods {
            let node = pod
                .spec
                .as_ref()
                .and_then(|spec| spec.node_name.clone())
                .unwrap_or_default();
            by_node.entry(node).or_default().push(pod);
        }
        PodLister {
            pods: by_node,
            fail_for: Vec::new(),
        }
    }

    #[test]
    fn test_parse_quantity_forms() {
        assert_eq!(parse_quantity("100m"), Some(0.1));
        assert_eq!(parse_quantity("1"), Some(1.0));
        assert_eq!(parse_quantity("2.5"), Some(2.5));
        assert_eq!(parse_quantity("1Ki"), Some(1024.0));
        assert_eq!(parse_quantity("128Mi"), Some(128.0 * 1024.0 * 1024.0));
        assert_eq!(parse_quantity("1G"), Some(1e9));
        assert_eq!(parse_quantity("garbage"), None);
        assert_eq!(parse_quantity("1X"), None);
    }

    #[test]
    fn test_cpu_and_memory_units() {
        assert_eq!(cpu_millis(&Quantity("100m".to_string())), 100);
        assert_eq!(cpu_millis(&Quantity("2".to_string())), 2000);
        assert_eq!(cpu_millis(&Quantity("0.5".to_string())), 500);
        assert_eq!(memory_bytes(&Quantity("1000".to_string())), 1000);
        assert_eq!(memory_bytes(&Quantity("1Mi".to_string())), 1024 * 1024);
    }

    #[tokio::test]
    async fn test_workload_fits_on_single_target() {
        let old = node("old", "1", "1000Mi");
        let target = node("new", "1", "1000Mi");
        let cluster = lister(vec![
            pod("p", "old", "100m", "100Mi"),
            pod("existing", "new", "200m", "200Mi"),
        ]);
        assert!(has_enough_capacity_for(&cluster, &old, &[target]).await);
    }

    #[tokio::test]
    async fn test_workload_does_not_fit_when_demand_exceeds_supply() {
        let old = node("old", "2", "2000Mi");
        let target = node("new", "1", "1000Mi");
        let cluster = lister(vec![pod("p", "old", "1200m", "1200Mi")]);
        assert!(!has_enough_capacity_for(&cluster, &old, &[target.clone()]).await);

        // the sum across targets is what matters
        let second = node("new-2", "1", "1000Mi");
        assert!(has_enough_capacity_for(&cluster, &old, &[target, second]).await);
    }

    #[tokio::test]
    async fn test_adding_a_target_never_turns_feasible_into_infeasible() {
        let old = node("old", "1", "1000Mi");
        let target = node("new", "1", "1000Mi");
        let extra = node("new-2", "1", "1000Mi");
        let cluster = lister(vec![pod("p", "old", "500m", "500Mi")]);
        assert!(has_enough_capacity_for(&cluster, &old, &[target.clone()]).await);
        assert!(has_enough_capacity_for(&cluster, &old, &[target, extra]).await);
    }

    #[tokio::test]
    async fn test_daemon_set_pods_are_not_demand() {
        let old = node("old", "1", "1000Mi");
        let target = node("new", "500m", "500Mi");
        let cluster = lister(vec![
            daemon_set_pod("ds", "old", "900m", "900Mi"),
            pod("p", "old", "100m", "100Mi"),
        ]);
        assert!(has_enough_capacity_for(&cluster, &old, &[target]).await);
    }

    #[tokio::test]
    async fn test_terminal_pods_count_on_neither_side() {
        let old = node("old", "1", "1000Mi");
        let target = node("new", "500m", "500Mi");
        let mut finished = pod("done", "old", "900m", "900Mi");
        finished.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        let mut failed_on_target = pod("crashed", "new", "400m", "400Mi");
        failed_on_target.status = Some(PodStatus {
            phase: Some("Failed".to_string()),
            ..Default::default()
        });
        let cluster = lister(vec![finished, failed_on_target, pod("p", "old", "100m", "100Mi")]);
        assert!(has_enough_capacity_for(&cluster, &old, &[target]).await);
    }

    #[tokio::test]
    async fn test_empty_targets_with_zero_demand_is_feasible() {
        let old = node("old", "1", "1000Mi");
        let cluster = lister(vec![]);
        assert!(has_enough_capacity_for(&cluster, &old, &[]).await);

        let cluster = lister(vec![pod("p", "old", "100m", "100Mi")]);
        assert!(!has_enough_capacity_for(&cluster, &old, &[]).await);
    }

    #[tokio::test]
    async fn test_list_failure_on_outdated_node_assumes_feasible() {
        let old = node("old", "1", "1000Mi");
        let mut cluster = lister(vec![]);
        cluster.fail_for = vec!["old".to_string()];
        assert!(has_enough_capacity_for(&cluster, &old, &[]).await);
    }

    #[tokio::test]
    async fn test_list_failure_on_target_removes_its_supply() {
        let old = node("old", "1", "1000Mi");
        let target = node("new", "4", "4000Mi");
        let mut cluster = lister(vec![pod("p", "old", "100m", "100Mi")]);
        cluster.fail_for = vec!["new".to_string()];
        assert!(!has_enough_capacity_for(&cluster, &old, &[target]).await);
    }
}
