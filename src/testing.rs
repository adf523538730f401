//! In-memory doubles for the cloud and cluster capability sets
//!
//! Used by the unit and scenario test suites; nothing here talks to a real
//! API. Both fakes count calls per method so tests can assert on idempotence
//! and on the number of side effects a tick produced.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod};

use crate::cloud::{
    AutoScalingGroup, CloudProvider, Instance, LaunchTemplate, LaunchTemplateSpec, TagFilter,
};
use crate::k8s::{node_name, ClusterClient, DrainOptions};
use crate::error::Error;
use crate::Result;

/// In-memory [`ClusterClient`]
#[derive(Default)]
pub struct FakeCluster {
    nodes: Mutex<BTreeMap<String, Node>>,
    pods: Mutex<Vec<Pod>>,
    calls: Mutex<BTreeMap<&'static str, u64>>,
    fail_drains_for: Mutex<Vec<String>>,
    drained: Mutex<Vec<String>>,
}

impl FakeCluster {
    /// Build a cluster holding the given nodes and pods
    pub fn new(nodes: Vec<Node>, pods: Vec<Pod>) -> Self {
        let cluster = Self::default();
        for node in nodes {
            cluster.put_node(node);
        }
        *cluster.pods.lock().unwrap() = pods;
        cluster
    }

    /// Insert or replace a node
    pub fn put_node(&self, node: Node) {
        self.nodes
            .lock()
            .unwrap()
            .insert(node_name(&node).to_string(), node);
    }

    /// Snapshot of a stored node
    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Make drains of this node fail
    pub fn fail_drains_for(&self, node: &str) {
        self.fail_drains_for.lock().unwrap().push(node.to_string());
    }

    /// Names of nodes drained so far, in order
    pub fn drained_nodes(&self) -> Vec<String> {
        self.drained.lock().unwrap().clone()
    }

    /// How many times the named method was called
    pub fn call_count(&self, method: &str) -> u64 {
        self.calls.lock().unwrap().get(method).copied().unwrap_or_default()
    }

    fn count(&self, method: &'static str) {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_nodes(&self) -> Result<Vec<Node>> {
        self.count("get_nodes");
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn get_pods_in_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        self.count("get_pods_in_node");
        Ok(self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|pod| {
                pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        self.count("update_node");
        self.put_node(node.clone());
        Ok(())
    }

    async fn cordon(&self, node_name: &str) -> Result<()> {
        self.count("cordon");
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(node) = nodes.get_mut(node_name) {
            node.spec
                .get_or_insert_with(NodeSpec::default)
                .unschedulable = Some(true);
        }
        Ok(())
    }

    async fn drain(&self, node_name: &str, _options: DrainOptions) -> Result<()> {
        self.count("drain");
        if self
            .fail_drains_for
            .lock()
            .unwrap()
            .iter()
            .any(|name| name == node_name)
        {
            return Err(Error::drain(node_name, "injected failure"));
        }
        self.drained.lock().unwrap().push(node_name.to_string());
        Ok(())
    }
}

/// In-memory [`CloudProvider`]
#[derive(Default)]
pub struct FakeCloudProvider {
    groups: Mutex<Vec<AutoScalingGroup>>,
    templates: Mutex<Vec<LaunchTemplate>>,
    calls: Mutex<BTreeMap<&'static str, u64>>,
    terminated: Mutex<Vec<(String, bool)>>,
    fail_set_desired_capacity: Mutex<bool>,
}

impl FakeCloudProvider {
    /// Build a provider holding the given ASGs and template descriptions
    pub fn new(groups: Vec<AutoScalingGroup>, templates: Vec<LaunchTemplate>) -> Self {
        Self {
            groups: Mutex::new(groups),
            templates: Mutex::new(templates),
            ..Default::default()
        }
    }

    /// Snapshot of a stored ASG
    pub fn group(&self, name: &str) -> Option<AutoScalingGroup> {
        self.groups
            .lock()
            .unwrap()
            .iter()
            .find(|group| group.name == name)
            .cloned()
    }

    /// Insert or replace an ASG
    pub fn put_group(&self, group: AutoScalingGroup) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(existing) = groups.iter_mut().find(|existing| existing.name == group.name) {
            *existing = group;
        } else {
            groups.push(group);
        }
    }

    /// `(instance id, decrement)` pairs terminated so far, in order
    pub fn terminated_instances(&self) -> Vec<(String, bool)> {
        self.terminated.lock().unwrap().clone()
    }

    /// Make every capacity change fail
    pub fn fail_set_desired_capacity(&self) {
        *self.fail_set_desired_capacity.lock().unwrap() = true;
    }

    /// How many times the named method was called
    pub fn call_count(&self, method: &str) -> u64 {
        self.calls.lock().unwrap().get(method).copied().unwrap_or_default()
    }

    fn count(&self, method: &'static str) {
        *self.calls.lock().unwrap().entry(method).or_default() += 1;
    }
}

#[async_trait]
impl CloudProvider for FakeCloudProvider {
    async fn describe_autoscaling_groups_by_names(
        &self,
        names: &[String],
    ) -> Result<Vec<AutoScalingGroup>> {
        self.count("describe_autoscaling_groups_by_names");
        Ok(self
            .groups
            .lock()
            .unwrap()
            .iter()
            .filter(|group| names.contains(&group.name))
            .cloned()
            .collect())
    }

    async fn describe_autoscaling_groups_by_tags(
        &self,
        filters: &[TagFilter],
    ) -> Result<Vec<AutoScalingGroup>> {
        self.count("describe_autoscaling_groups_by_tags");
        Ok(self
            .groups
            .lock()
            .unwrap()
            .iter()
            .filter(|group| group.matches_tags(filters))
            .cloned()
            .collect())
    }

    async fn describe_autoscaling_group(&self, name: &str) -> Result<Option<AutoScalingGroup>> {
        self.count("describe_autoscaling_group");
        Ok(self.group(name))
    }

    async fn describe_launch_template(
        &self,
        spec: &LaunchTemplateSpec,
    ) -> Result<Option<LaunchTemplate>> {
        self.count("describe_launch_template");
        Ok(self
            .templates
            .lock()
            .unwrap()
            .iter()
            .find(|template| {
                spec.id.as_deref() == Some(&template.id)
                    || spec.name.as_deref() == Some(&template.name)
            })
            .cloned())
    }

    async fn set_desired_capacity(&self, asg_name: &str, count: i32) -> Result<()> {
        self.count("set_desired_capacity");
        if *self.fail_set_desired_capacity.lock().unwrap() {
            return Err(Error::cloud("injected capacity failure"));
        }
        let mut groups = self.groups.lock().unwrap();
        let group = groups
            .iter_mut()
            .find(|group| group.name == asg_name)
            .ok_or_else(|| Error::cloud(format!("no such ASG {asg_name:?}")))?;
        group.desired_capacity = count;
        Ok(())
    }

    async fn terminate_instance(
        &self,
        instance_id: &str,
        decrement_desired_capacity: bool,
    ) -> Result<()> {
        self.count("terminate_instance");
        self.terminated
            .lock()
            .unwrap()
            .push((instance_id.to_string(), decrement_desired_capacity));
        Ok(())
    }
}

/// Node fixture with a provider id pointing at the given instance
pub fn test_node(name: &str, availability_zone: &str, instance_id: &str) -> Node {
    let mut node = Node::default();
    node.metadata.name = Some(name.to_string());
    node.metadata.annotations = Some(Default::default());
    node.spec = Some(NodeSpec {
        provider_id: Some(format!("aws:///{availability_zone}/{instance_id}")),
        ..Default::default()
    });
    node
}

/// Instance fixture in the given lifecycle state
pub fn test_instance(instance_id: &str, availability_zone: &str, lifecycle_state: &str) -> Instance {
    Instance {
        instance_id: instance_id.to_string(),
        availability_zone: availability_zone.to_string(),
        lifecycle_state: lifecycle_state.to_string(),
        ..Default::default()
    }
}
