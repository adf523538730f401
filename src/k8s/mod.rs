//! Cluster-side capability set and the node annotation store
//!
//! Rollout state lives on the cluster: four RFC3339 phase annotations and an
//! optional exclusion label persisted on each node. The process itself is
//! stateless between ticks and may be restarted at will.
//!
//! [`ClusterClient`] is the narrow interface the reconciler depends on;
//! [`KubernetesClient`] implements it with kube-rs for production and the
//! test suite supplies in-memory fakes.

mod client;
pub mod drain;
pub mod resources;

pub use client::KubernetesClient;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};

use crate::cloud::Instance;
use crate::error::Error;
use crate::Result;

/// Annotation marking when the rollout of a node began
pub const ANNOTATION_ROLLING_UPDATE_STARTED_AT: &str = "rolling-update/started-at";
/// Annotation marking when the node was cordoned by this controller
pub const ANNOTATION_ROLLING_UPDATE_CORDONED_AT: &str = "rolling-update/cordoned-at";
/// Annotation marking when the node finished draining
pub const ANNOTATION_ROLLING_UPDATE_DRAINED_AT: &str = "rolling-update/drained-at";
/// Annotation marking when the backing instance was scheduled for termination
pub const ANNOTATION_ROLLING_UPDATE_TERMINATED_AT: &str = "rolling-update/terminated-at";

/// Label that takes a node out of external load balancer target sets
pub const LABEL_EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS: &str =
    "node.kubernetes.io/exclude-from-external-load-balancers";

/// Taint effect that prevents new pods from being scheduled
pub const TAINT_EFFECT_NO_SCHEDULE: &str = "NoSchedule";

/// Options controlling how nodes are drained
#[derive(Clone, Copy, Debug)]
pub struct DrainOptions {
    /// Leave DaemonSet pods alone (their controller ignores cordons anyway)
    pub ignore_daemon_sets: bool,
    /// Allow evicting pods with emptyDir volumes, losing that data
    pub delete_empty_dir_data: bool,
    /// Override for the pods' own termination grace period, in seconds
    pub grace_period_seconds: Option<i64>,
}

impl From<&crate::config::Config> for DrainOptions {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            ignore_daemon_sets: config.ignore_daemon_sets,
            delete_empty_dir_data: config.delete_empty_dir_data,
            grace_period_seconds: config.drain_grace_period(),
        }
    }
}

/// Capability set the reconciler needs from the cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List all nodes; implementations may serve this from a short-lived cache
    async fn get_nodes(&self) -> Result<Vec<Node>>;

    /// List all pods scheduled onto the given node
    async fn get_pods_in_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Persist a modified node
    async fn update_node(&self, node: &Node) -> Result<()>;

    /// Mark a node unschedulable without evicting anything
    async fn cordon(&self, node_name: &str) -> Result<()>;

    /// Cordon the node and evict all evictable pods from it
    async fn drain(&self, node_name: &str, options: DrainOptions) -> Result<()>;
}

/// The provider id a node backed by this instance carries
pub fn provider_id(instance: &Instance) -> String {
    format!(
        "aws:///{}/{}",
        instance.availability_zone, instance.instance_id
    )
}

/// Extract the node belonging to an instance from a node-list snapshot
pub fn filter_node_by_instance<'a>(nodes: &'a [Node], instance: &Instance) -> Option<&'a Node> {
    let id = provider_id(instance);
    nodes
        .iter()
        .find(|node| node.spec.as_ref().and_then(|spec| spec.provider_id.as_deref()) == Some(id.as_str()))
}

/// Fetch the node belonging to an instance, erroring on a miss
pub async fn get_node_by_instance(
    cluster: &dyn ClusterClient,
    instance: &Instance,
) -> Result<Node> {
    let nodes = cluster.get_nodes().await?;
    filter_node_by_instance(&nodes, instance)
        .cloned()
        .ok_or_else(|| Error::NodeNotFound(provider_id(instance)))
}

/// Name of a node; empty when the API returned a nameless object
pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

/// Whether the kubelet reports `Ready=True` on its most recent Ready condition
pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .rev()
                .find(|condition| condition.type_ == "Ready")
        })
        .is_some_and(|condition| condition.status == "True")
}

/// Current time in the RFC3339 form used for phase annotations
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a phase annotation value; `None` when absent or unparseable
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Snapshot of a node's rollout phase annotations
///
/// Presence of a key means the phase was reached, even when the recorded
/// timestamp no longer parses; parsed times are only used for logging and
/// the taint-cleanup comparison.
#[derive(Clone, Debug, Default)]
pub struct RolloutPhases {
    /// Raw `started-at` value
    pub started_at: Option<String>,
    /// Raw `cordoned-at` value
    pub cordoned_at: Option<String>,
    /// Raw `drained-at` value
    pub drained_at: Option<String>,
    /// Raw `terminated-at` value
    pub terminated_at: Option<String>,
}

impl RolloutPhases {
    /// Read the phase annotations off a node
    pub fn from_node(node: &Node) -> Self {
        let get = |key: &str| {
            node.metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(key))
                .cloned()
        };
        Self {
            started_at: get(ANNOTATION_ROLLING_UPDATE_STARTED_AT),
            cordoned_at: get(ANNOTATION_ROLLING_UPDATE_CORDONED_AT),
            drained_at: get(ANNOTATION_ROLLING_UPDATE_DRAINED_AT),
            terminated_at: get(ANNOTATION_ROLLING_UPDATE_TERMINATED_AT),
        }
    }

    /// Whole minutes elapsed since the given phase value, when it parses
    pub fn minutes_since(value: &str) -> Option<i64> {
        parse_timestamp(value).map(|at| (Utc::now() - at).num_minutes())
    }
}

/// Set an annotation on a node, persisting only when the value changes
///
/// Repeated calls with the same `(key, value)` cause no API call beyond the
/// first, which keeps annotation writes safe to retry every tick.
pub async fn annotate_node(
    cluster: &dyn ClusterClient,
    node: &Node,
    key: &str,
    value: &str,
) -> Result<()> {
    let current = node
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key));
    if current.map(String::as_str) == Some(value) {
        return Ok(());
    }
    let mut updated = node.clone();
    updated
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
    cluster.update_node(&updated).await
}

/// Annotate the node backing an instance, re-reading it first
///
/// The fresh read matters: earlier writes in the same tick (a cordon, a
/// prior annotation) bump the node's resource version, and replacing a
/// stale snapshot would be rejected.
pub async fn annotate_node_by_instance(
    cluster: &dyn ClusterClient,
    instance: &Instance,
    key: &str,
    value: &str,
) -> Result<()> {
    let node = get_node_by_instance(cluster, instance).await?;
    annotate_node(cluster, &node, key, value).await
}

/// Label the node backing an instance, re-reading it first
pub async fn label_node_by_instance(
    cluster: &dyn ClusterClient,
    instance: &Instance,
    key: &str,
    value: &str,
) -> Result<()> {
    let node = get_node_by_instance(cluster, instance).await?;
    label_node(cluster, &node, key, value).await
}

/// Set a label on a node, persisting only when the value changes
pub async fn label_node(
    cluster: &dyn ClusterClient,
    node: &Node,
    key: &str,
    value: &str,
) -> Result<()> {
    let current = node
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key));
    if current.map(String::as_str) == Some(value) {
        return Ok(());
    }
    let mut updated = node.clone();
    updated
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value.to_string());
    cluster.update_node(&updated).await
}
