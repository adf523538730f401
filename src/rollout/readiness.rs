//! Readiness of updated instances, plus stale-cordon cleanup
//!
//! An updated instance only counts as a drain target once its cloud
//! lifecycle is `InService` and the backing node's kubelet reports
//! `Ready=True`. Everything else is tallied as non-ready so the reconciler
//! can decide whether the pool is settled enough to make progress.

use k8s_openapi::api::core::v1::Node;
use tracing::{info, warn};

use crate::cloud::Instance;
use crate::k8s::{
    self, node_name, ClusterClient, RolloutPhases, ANNOTATION_ROLLING_UPDATE_STARTED_AT,
    TAINT_EFFECT_NO_SCHEDULE,
};

/// Outcome of probing an ASG's updated instances
#[derive(Clone, Debug, Default)]
pub struct Readiness {
    /// Nodes backed by `InService` updated instances with a ready kubelet
    pub ready_nodes: Vec<Node>,
    /// Updated instances or nodes that are not (yet) usable targets
    pub non_ready: usize,
}

/// Probe each updated instance and heal stale cordons along the way
pub async fn probe_updated_instances(
    cluster: &dyn ClusterClient,
    asg_name: &str,
    updated: &[Instance],
) -> Readiness {
    let mut readiness = Readiness::default();
    for instance in updated {
        if !instance.is_in_service() {
            readiness.non_ready += 1;
            info!(
                asg = %asg_name,
                instance = %instance.instance_id,
                lifecycle_state = %instance.lifecycle_state,
                "updated instance is not in service yet"
            );
            continue;
        }
        let node = match k8s::get_node_by_instance(cluster, instance).await {
            Ok(node) => node,
            Err(e) => {
                readiness.non_ready += 1;
                info!(
                    asg = %asg_name,
                    instance = %instance.instance_id,
                    error = %e,
                    "updated instance has no node yet"
                );
                continue;
            }
        };
        if k8s::node_is_ready(&node) {
            readiness.ready_nodes.push(node.clone());
        } else {
            readiness.non_ready += 1;
            info!(
                asg = %asg_name,
                instance = %instance.instance_id,
                node = %node_name(&node),
                "updated node is not ready to accept pods"
            );
        }
        clean_up_stale_cordon(cluster, asg_name, &node).await;
    }
    readiness
}

/// Remove a leftover cordon from a node the classifier now considers updated
///
/// A launch-template rollback while a drain was in flight leaves a node that
/// is updated again but still cordoned and still annotated as started. Any
/// `NoSchedule` taint added after the recorded start (or whose start value
/// no longer parses) is removed together with the annotation, making the
/// node eligible as a drain target on the next tick.
async fn clean_up_stale_cordon(cluster: &dyn ClusterClient, asg_name: &str, node: &Node) {
    let phases = RolloutPhases::from_node(node);
    let Some(started_at) = phases.started_at else {
        return;
    };
    let started_at = k8s::parse_timestamp(&started_at);
    let taints = node
        .spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .cloned()
        .unwrap_or_default();
    for (index, taint) in taints.iter().enumerate() {
        if taint.effect != TAINT_EFFECT_NO_SCHEDULE {
            continue;
        }
        let added_after_start = match (&taint.time_added, started_at) {
            // an unparseable start can't prove the taint predates it
            (_, None) => true,
            (Some(added), Some(started)) => added.0 > started,
            (None, Some(_)) => false,
        };
        if !added_after_start {
            continue;
        }
        warn!(
            asg = %asg_name,
            node = %node_name(node),
            "removing stale cordon from updated node"
        );
        let mut updated = node.clone();
        if let Some(spec_taints) = updated.spec.as_mut().and_then(|spec| spec.taints.as_mut()) {
            spec_taints.remove(index);
        }
        if let Some(annotations) = updated.metadata.annotations.as_mut() {
            annotations.remove(ANNOTATION_ROLLING_UPDATE_STARTED_AT);
        }
        if let Err(e) = cluster.update_node(&updated).await {
            warn!(
                asg = %asg_name,
                node = %node_name(node),
                error = %e,
                "unable to update node while removing stale cordon"
            );
        }
        break;
    }
}
