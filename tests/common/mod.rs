//! Builders shared by the scenario tests

use k8s_openapi::api::core::v1::{
    Container, Node, NodeCondition, NodeStatus, Pod, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use asg_roller::cloud::{
    AutoScalingGroup, Instance, LaunchTemplate, LaunchTemplateSpec, LIFECYCLE_STATE_IN_SERVICE,
};
use asg_roller::testing::test_node;

pub const AZ: &str = "us-west-2a";

pub fn template_spec(id: &str, version: &str) -> LaunchTemplateSpec {
    LaunchTemplateSpec {
        id: Some(id.to_string()),
        name: Some(format!("{id}-name")),
        version: Some(version.to_string()),
    }
}

pub fn template_description(id: &str, default_version: i64, latest_version: i64) -> LaunchTemplate {
    LaunchTemplate {
        id: id.to_string(),
        name: format!("{id}-name"),
        default_version,
        latest_version,
    }
}

pub fn instance(id: &str, lifecycle_state: &str, template: &LaunchTemplateSpec) -> Instance {
    Instance {
        instance_id: id.to_string(),
        availability_zone: AZ.to_string(),
        lifecycle_state: lifecycle_state.to_string(),
        launch_template: Some(template.clone()),
        ..Default::default()
    }
}

pub fn in_service_instance(id: &str, template: &LaunchTemplateSpec) -> Instance {
    instance(id, LIFECYCLE_STATE_IN_SERVICE, template)
}

pub fn asg(
    name: &str,
    (min, desired, max): (i32, i32, i32),
    target: LaunchTemplateSpec,
    instances: Vec<Instance>,
) -> AutoScalingGroup {
    AutoScalingGroup {
        name: name.to_string(),
        min_size: min,
        desired_capacity: desired,
        max_size: max,
        instances,
        launch_template: Some(target),
        ..Default::default()
    }
}

pub fn ready_node(name: &str, instance_id: &str, cpu: &str, memory: &str) -> Node {
    let mut node = test_node(name, AZ, instance_id);
    node.status = Some(NodeStatus {
        allocatable: Some(
            [
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
            ]
            .into(),
        ),
        conditions: Some(vec![NodeCondition {
            type_: "Ready".to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    });
    node
}

pub fn pod(name: &str, node_name: &str, cpu: &str, memory: &str) -> Pod {
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

pub fn annotations_of(node: &Node) -> std::collections::BTreeMap<String, String> {
    node.metadata.annotations.clone().unwrap_or_default()
}
