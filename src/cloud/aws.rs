//! AWS implementation of the cloud capability set
//!
//! Thin translation layer over `aws-sdk-autoscaling` and `aws-sdk-ec2`:
//! every SDK shape is converted into the domain model at this boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_autoscaling::error::DisplayErrorContext;
use aws_sdk_autoscaling::types as asg_types;
use aws_sdk_ec2::types as ec2_types;
use tracing::debug;

use crate::cloud::{
    AutoScalingGroup, CloudProvider, Instance, LaunchTemplate, LaunchTemplateOverride,
    LaunchTemplateSpec, TagFilter,
};
use crate::error::Error;
use crate::Result;

/// Production [`CloudProvider`] backed by the AWS SDK
#[derive(Clone)]
pub struct AwsCloudProvider {
    autoscaling: aws_sdk_autoscaling::Client,
    ec2: aws_sdk_ec2::Client,
}

impl AwsCloudProvider {
    /// Create AutoScaling and EC2 clients for the given region
    pub async fn new(region: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            autoscaling: aws_sdk_autoscaling::Client::new(&sdk_config),
            ec2: aws_sdk_ec2::Client::new(&sdk_config),
        }
    }

    async fn describe_all_groups(&self, names: Option<Vec<String>>) -> Result<Vec<AutoScalingGroup>> {
        let mut groups = Vec::new();
        let mut pages = self
            .autoscaling
            .describe_auto_scaling_groups()
            .set_auto_scaling_group_names(names)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                Error::cloud(format!("unable to describe ASGs: {}", DisplayErrorContext(&e)))
            })?;
            groups.extend(page.auto_scaling_groups().iter().map(convert_group));
        }
        Ok(groups)
    }
}

#[async_trait]
impl CloudProvider for AwsCloudProvider {
    async fn describe_autoscaling_groups_by_names(
        &self,
        names: &[String],
    ) -> Result<Vec<AutoScalingGroup>> {
        self.describe_all_groups(Some(names.to_vec())).await
    }

    async fn describe_autoscaling_groups_by_tags(
        &self,
        filters: &[TagFilter],
    ) -> Result<Vec<AutoScalingGroup>> {
        // Tag filtering happens client-side over the full listing; the
        // DescribeAutoScalingGroups filter parameter does not cover arbitrary
        // key=value pairs across accounts with older SDK service models.
        let groups = self.describe_all_groups(None).await?;
        debug!(total = groups.len(), "filtering discovered ASGs by tags");
        Ok(groups
            .into_iter()
            .filter(|group| group.matches_tags(filters))
            .collect())
    }

    async fn describe_autoscaling_group(&self, name: &str) -> Result<Option<AutoScalingGroup>> {
        let groups = self
            .describe_all_groups(Some(vec![name.to_string()]))
            .await?;
        Ok(groups.into_iter().find(|group| group.name == name))
    }

    async fn describe_launch_template(
        &self,
        spec: &LaunchTemplateSpec,
    ) -> Result<Option<LaunchTemplate>> {
        let mut request = self.ec2.describe_launch_templates();
        match (&spec.id, &spec.name) {
            (Some(id), _) if !id.is_empty() => request = request.launch_template_ids(id),
            (_, Some(name)) if !name.is_empty() => request = request.launch_template_names(name),
            _ => {
                return Err(Error::cloud(
                    "launch template reference carries neither id nor name",
                ))
            }
        }
        let output = request.send().await.map_err(|e| {
            Error::cloud(format!(
                "unable to describe launch template {:?}/{:?}: {}",
                spec.id,
                spec.name,
                DisplayErrorContext(&e)
            ))
        })?;
        Ok(output.launch_templates().first().map(convert_launch_template))
    }

    async fn set_desired_capacity(&self, asg_name: &str, count: i32) -> Result<()> {
        self.autoscaling
            .set_desired_capacity()
            .auto_scaling_group_name(asg_name)
            .desired_capacity(count)
            .honor_cooldown(true)
            .send()
            .await
            .map_err(|e| {
                Error::cloud(format!(
                    "unable to set desired capacity of {asg_name:?} to {count}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn terminate_instance(
        &self,
        instance_id: &str,
        decrement_desired_capacity: bool,
    ) -> Result<()> {
        self.autoscaling
            .terminate_instance_in_auto_scaling_group()
            .instance_id(instance_id)
            .should_decrement_desired_capacity(decrement_desired_capacity)
            .send()
            .await
            .map_err(|e| {
                Error::cloud(format!(
                    "unable to terminate instance {instance_id:?}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }
}

fn convert_group(group: &asg_types::AutoScalingGroup) -> AutoScalingGroup {
    // An ASG's launch template may live directly on the group or under the
    // mixed-instances policy; the policy form also carries the override list.
    let mut launch_template = group.launch_template().map(convert_template_spec);
    let mut overrides = Vec::new();
    if launch_template.is_none() {
        if let Some(policy_template) = group
            .mixed_instances_policy()
            .and_then(|policy| policy.launch_template())
        {
            launch_template = policy_template
                .launch_template_specification()
                .map(convert_template_spec);
            overrides = policy_template
                .overrides()
                .iter()
                .map(convert_override)
                .collect();
        }
    }
    AutoScalingGroup {
        name: group.auto_scaling_group_name().unwrap_or_default().to_string(),
        min_size: group.min_size().unwrap_or_default(),
        desired_capacity: group.desired_capacity().unwrap_or_default(),
        max_size: group.max_size().unwrap_or_default(),
        instances: group.instances().iter().map(convert_instance).collect(),
        launch_configuration_name: group.launch_configuration_name().map(str::to_string),
        launch_template,
        overrides,
        tags: group
            .tags()
            .iter()
            .filter_map(|tag| Some((tag.key()?.to_string(), tag.value().unwrap_or_default().to_string())))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn convert_instance(instance: &asg_types::Instance) -> Instance {
    Instance {
        instance_id: instance.instance_id().unwrap_or_default().to_string(),
        availability_zone: instance.availability_zone().unwrap_or_default().to_string(),
        lifecycle_state: instance
            .lifecycle_state()
            .map(|state| state.as_str().to_string())
            .unwrap_or_default(),
        instance_type: instance.instance_type().map(str::to_string),
        launch_configuration_name: instance.launch_configuration_name().map(str::to_string),
        launch_template: instance.launch_template().map(convert_template_spec),
    }
}

fn convert_template_spec(spec: &asg_types::LaunchTemplateSpecification) -> LaunchTemplateSpec {
    LaunchTemplateSpec {
        id: spec.launch_template_id().map(str::to_string),
        name: spec.launch_template_name().map(str::to_string),
        version: spec.version().map(str::to_string),
    }
}

fn convert_override(value: &asg_types::LaunchTemplateOverrides) -> LaunchTemplateOverride {
    LaunchTemplateOverride {
        instance_type: value.instance_type().map(str::to_string),
        launch_template: value
            .launch_template_specification()
            .map(convert_template_spec),
    }
}

fn convert_launch_template(template: &ec2_types::LaunchTemplate) -> LaunchTemplate {
    LaunchTemplate {
        id: template.launch_template_id().unwrap_or_default().to_string(),
        name: template.launch_template_name().unwrap_or_default().to_string(),
        default_version: template.default_version_number().unwrap_or_default(),
        latest_version: template.latest_version_number().unwrap_or_default(),
    }
}
