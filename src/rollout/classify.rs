//! Instance classification: outdated vs updated
//!
//! Partitions an ASG's instances by comparing each one's launch source
//! against the ASG's current target. Launch-configuration pools compare by
//! name; launch-template pools compare id, name, resolved version and,
//! when a mixed-instances override list is present, instance-type
//! membership. Symbolic versions (`$Latest`, `$Default`) are resolved
//! against the described template.

use std::collections::HashMap;

use crate::cloud::{
    AutoScalingGroup, CloudProvider, Instance, LaunchTemplate, LaunchTemplateOverride,
    LaunchTemplateSpec,
};
use crate::error::Error;
use crate::Result;

/// The two halves of an ASG's instance list
#[derive(Clone, Debug, Default)]
pub struct Classification {
    /// Instances whose launch source no longer matches the target
    pub outdated: Vec<Instance>,
    /// Instances launched from the current target
    pub updated: Vec<Instance>,
}

/// Partition an ASG's instances into outdated and updated
///
/// Instances keep the order the cloud returned them in. An ASG without a
/// launch template or launch configuration fails classification, as does a
/// target template that cannot be described; the caller skips the ASG for
/// the tick in both cases.
pub async fn partition_instances(
    cloud: &dyn CloudProvider,
    asg: &AutoScalingGroup,
) -> Result<Classification> {
    if let Some(target) = &asg.launch_template {
        partition_by_launch_template(cloud, target, &asg.overrides, &asg.instances).await
    } else if let Some(target) = &asg.launch_configuration_name {
        Ok(partition_by_launch_configuration(target, &asg.instances))
    } else {
        Err(Error::NoTemplateSource(asg.name.clone()))
    }
}

fn partition_by_launch_configuration(target: &str, instances: &[Instance]) -> Classification {
    let mut classification = Classification::default();
    for instance in instances {
        if instance.launch_configuration_name.as_deref() == Some(target) {
            classification.updated.push(instance.clone());
        } else {
            classification.outdated.push(instance.clone());
        }
    }
    classification
}

async fn partition_by_launch_template(
    cloud: &dyn CloudProvider,
    target: &LaunchTemplateSpec,
    overrides: &[LaunchTemplateOverride],
    instances: &[Instance],
) -> Result<Classification> {
    let mut templates = TemplateCache::default();
    let target_description = templates.describe(cloud, target).await?;

    let mut classification = Classification::default();
    for instance in instances {
        // An override may pin its own template; that reference replaces the
        // ASG's target for this instance only.
        let (effective_target, effective_description) =
            match promoted_override(overrides, instance) {
                Some(promoted) => {
                    let description = templates.describe(cloud, promoted).await?;
                    (promoted, description)
                }
                None => (target, target_description.clone()),
            };
        if is_outdated(instance, effective_target, &effective_description, overrides) {
            classification.outdated.push(instance.clone());
        } else {
            classification.updated.push(instance.clone());
        }
    }
    Ok(classification)
}

fn is_outdated(
    instance: &Instance,
    target: &LaunchTemplateSpec,
    description: &LaunchTemplate,
    overrides: &[LaunchTemplateOverride],
) -> bool {
    let Some(instance_template) = &instance.launch_template else {
        return true;
    };
    if blank(instance_template.name.as_deref()) != blank(target.name.as_deref()) {
        return true;
    }
    if blank(instance_template.id.as_deref()) != blank(target.id.as_deref()) {
        return true;
    }
    if !versions_match(
        description,
        target.version.as_deref(),
        instance_template.version.as_deref(),
    ) {
        return true;
    }
    if !overrides.is_empty() && !override_list_contains(overrides, instance.instance_type.as_deref())
    {
        return true;
    }
    false
}

/// The override whose template reference replaces the target, if any
fn promoted_override<'a>(
    overrides: &'a [LaunchTemplateOverride],
    instance: &Instance,
) -> Option<&'a LaunchTemplateSpec> {
    let instance_type = instance.instance_type.as_deref()?;
    overrides
        .iter()
        .find(|entry| entry.instance_type.as_deref() == Some(instance_type))
        .and_then(|entry| entry.launch_template.as_ref())
}

fn override_list_contains(
    overrides: &[LaunchTemplateOverride],
    instance_type: Option<&str>,
) -> bool {
    overrides
        .iter()
        .any(|entry| blank(entry.instance_type.as_deref()) == blank(instance_type))
}

/// Absent values compare as empty strings
fn blank(value: Option<&str>) -> &str {
    value.unwrap_or_default()
}

/// Whether two version specifiers resolve to the same version
///
/// `$Default` and `$Latest` resolve through the template description;
/// anything else compares literally. Absent versions are equal to each
/// other and unequal to any present version.
pub fn versions_match(
    description: &LaunchTemplate,
    left: Option<&str>,
    right: Option<&str>,
) -> bool {
    resolve_version(description, left) == resolve_version(description, right)
}

fn resolve_version(description: &LaunchTemplate, version: Option<&str>) -> Option<String> {
    match version {
        None => None,
        Some("$Default") => Some(description.default_version.to_string()),
        Some("$Latest") => Some(description.latest_version.to_string()),
        Some(literal) => Some(literal.to_string()),
    }
}

/// Memoizes template descriptions for one classification pass
#[derive(Default)]
struct TemplateCache {
    described: HashMap<(String, String), LaunchTemplate>,
}

impl TemplateCache {
    async fn describe(
        &mut self,
        cloud: &dyn CloudProvider,
        spec: &LaunchTemplateSpec,
    ) -> Result<LaunchTemplate> {
        let key = (
            spec.id.clone().unwrap_or_default(),
            spec.name.clone().unwrap_or_default(),
        );
        if let Some(known) = self.described.get(&key) {
            return Ok(known.clone());
        }
        let description = cloud
            .describe_launch_template(spec)
            .await?
            .ok_or_else(|| Error::LaunchTemplateNotFound(format!("{}/{}", key.0, key.1)))?;
        self.described.insert(key, description.clone());
        Ok(description)
    }
}
