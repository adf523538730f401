//! Cloud provider abstraction layer
//!
//! The reconciler depends on a narrow capability set for the cloud side:
//! describe ASGs, describe launch templates, adjust desired capacity and
//! terminate instances. [`CloudProvider`] captures that set so the rollout
//! logic can be exercised against in-memory fakes; [`AwsCloudProvider`]
//! wraps the AWS SDK for production.
//!
//! Everything above this module works with the domain types defined here;
//! SDK types never escape `cloud::aws`.

mod aws;

pub use aws::AwsCloudProvider;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Error;
use crate::Result;

/// Lifecycle state reported for instances that are in service
pub const LIFECYCLE_STATE_IN_SERVICE: &str = "InService";

/// Tag marking an ASG as managed by the cluster autoscaler; its value is
/// written as `true`, `TRUE` or `True` in the wild and compares
/// case-insensitively
pub const TAG_CLUSTER_AUTOSCALER_ENABLED: &str = "k8s.io/cluster-autoscaler/enabled";

/// A `key=value` pair an ASG's tag set must contain to be discovered
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TagFilter {
    /// Tag key
    pub key: String,
    /// Required tag value
    pub value: String,
}

impl TagFilter {
    /// Create a tag filter
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse a comma-separated `k=v,k2=v2` filter list
    pub fn parse_list(tags: &str) -> Result<Vec<Self>> {
        tags.trim()
            .split(',')
            .map(|pair| {
                pair.split_once('=')
                    .map(|(key, value)| Self::new(key.trim(), value.trim()))
                    .ok_or_else(|| Error::config(format!("invalid tag filter {pair:?}, expected k=v")))
            })
            .collect()
    }
}

/// Reference to a launch template, as carried by ASGs and instances
///
/// Any of the fields may be absent; versions may be symbolic (`$Latest`,
/// `$Default`) until resolved against a [`LaunchTemplate`] description.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchTemplateSpec {
    /// Template id (`lt-...`)
    pub id: Option<String>,
    /// Template name
    pub name: Option<String>,
    /// Literal or symbolic version
    pub version: Option<String>,
}

/// One entry of a mixed-instances override list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchTemplateOverride {
    /// Permitted instance type
    pub instance_type: Option<String>,
    /// Optional per-type template reference that replaces the ASG's target
    pub launch_template: Option<LaunchTemplateSpec>,
}

/// Description of a launch template, used to resolve symbolic versions
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LaunchTemplate {
    /// Template id
    pub id: String,
    /// Template name
    pub name: String,
    /// Version number `$Default` resolves to
    pub default_version: i64,
    /// Version number `$Latest` resolves to
    pub latest_version: i64,
}

/// An instance as reported by the ASG
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Instance {
    /// Instance id (`i-...`)
    pub instance_id: String,
    /// Availability zone the instance runs in
    pub availability_zone: String,
    /// Lifecycle state (`Pending`, `InService`, terminating variants, ...)
    pub lifecycle_state: String,
    /// Instance type (e.g. `c5d.2xlarge`)
    pub instance_type: Option<String>,
    /// Launch configuration the instance was created from, if any
    pub launch_configuration_name: Option<String>,
    /// Launch template reference the instance was created from, if any
    pub launch_template: Option<LaunchTemplateSpec>,
}

impl Instance {
    /// Whether the cloud reports the instance as in service
    pub fn is_in_service(&self) -> bool {
        self.lifecycle_state == LIFECYCLE_STATE_IN_SERVICE
    }
}

/// An auto-scaling group snapshot, read once per tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AutoScalingGroup {
    /// ASG name
    pub name: String,
    /// Minimum pool size
    pub min_size: i32,
    /// Current desired capacity
    pub desired_capacity: i32,
    /// Maximum pool size
    pub max_size: i32,
    /// Current instance list, in the order the cloud returns them
    pub instances: Vec<Instance>,
    /// Launch configuration target, if the ASG uses one
    pub launch_configuration_name: Option<String>,
    /// Launch template target, direct or via the mixed-instances policy
    pub launch_template: Option<LaunchTemplateSpec>,
    /// Mixed-instances override list; empty when no policy is in effect
    pub overrides: Vec<LaunchTemplateOverride>,
    /// ASG tags
    pub tags: BTreeMap<String, String>,
}

impl AutoScalingGroup {
    /// Whether this ASG's tag set contains every requested `k=v` pair
    ///
    /// Values compare exactly, except the autoscaler `enabled` tag whose
    /// value is case-insensitive.
    pub fn matches_tags(&self, filters: &[TagFilter]) -> bool {
        filters.iter().all(|filter| {
            self.tags.get(&filter.key).is_some_and(|value| {
                if filter.key == TAG_CLUSTER_AUTOSCALER_ENABLED {
                    value.eq_ignore_ascii_case(&filter.value)
                } else {
                    *value == filter.value
                }
            })
        })
    }
}

/// Capability set the reconciler needs from the cloud
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Describe the named ASGs
    async fn describe_autoscaling_groups_by_names(
        &self,
        names: &[String],
    ) -> Result<Vec<AutoScalingGroup>>;

    /// Describe all ASGs whose tags contain every requested `k=v` pair
    async fn describe_autoscaling_groups_by_tags(
        &self,
        filters: &[TagFilter],
    ) -> Result<Vec<AutoScalingGroup>>;

    /// Re-read a single ASG; `None` when it no longer exists
    async fn describe_autoscaling_group(&self, name: &str) -> Result<Option<AutoScalingGroup>>;

    /// Describe the launch template a spec points at, by id or by name
    async fn describe_launch_template(
        &self,
        spec: &LaunchTemplateSpec,
    ) -> Result<Option<LaunchTemplate>>;

    /// Set the ASG's desired capacity, honoring the scaling cooldown
    async fn set_desired_capacity(&self, asg_name: &str, count: i32) -> Result<()>;

    /// Terminate an instance, optionally decrementing desired capacity
    async fn terminate_instance(&self, instance_id: &str, decrement_desired_capacity: bool)
        -> Result<()>;
}
