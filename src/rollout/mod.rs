//! The rolling-update reconciler
//!
//! One [`Reconciler::run`] call is one tick: for every managed ASG the
//! instances are partitioned into outdated and updated, replacement
//! readiness is measured, and each outdated instance is pushed through the
//! phase machine encoded by its node annotations:
//!
//! ```text
//! (none) --annotate--> started --capacity full?--> drained --> terminated
//!                         |           no: desired += 1, next ASG
//!                         v
//!                  feasibility check against ready updated nodes
//! ```
//!
//! Progress is deliberately slow: at most one capacity increase per ASG per
//! tick and at most one drain+terminate across the whole tick, so the next
//! pass re-reads cloud state before anything else moves.

pub mod classify;
pub mod readiness;

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info, warn};

use crate::cloud::{AutoScalingGroup, CloudProvider, Instance};
use crate::config::Config;
use crate::k8s::{
    self, node_name, ClusterClient, DrainOptions, RolloutPhases,
    ANNOTATION_ROLLING_UPDATE_CORDONED_AT, ANNOTATION_ROLLING_UPDATE_DRAINED_AT,
    ANNOTATION_ROLLING_UPDATE_STARTED_AT, ANNOTATION_ROLLING_UPDATE_TERMINATED_AT,
    LABEL_EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS,
};
use crate::error::Error;
use crate::metrics;
use crate::Result;

// Non-ready gating outside slow mode: a handful of in-flight launches is
// fine, but they must stay a small fraction of the ready fleet. Zero ready
// with zero non-ready passes, so tiny pools are not dead-locked.
const MAX_NON_READY: usize = 5;
const NON_READY_PER_READY: usize = 10;

/// What reconciling a single ASG decided for the rest of the tick
enum AsgOutcome {
    /// Keep going with the next ASG
    Continue,
    /// An instance was drained and terminated; end the tick so the next one
    /// re-reads cloud state
    RolledOut,
}

/// Per-tick driver of the rollout state machine
pub struct Reconciler {
    cloud: Arc<dyn CloudProvider>,
    cluster: Arc<dyn ClusterClient>,
    config: Config,
}

impl Reconciler {
    /// Create a reconciler over the given capability handles
    pub fn new(cloud: Arc<dyn CloudProvider>, cluster: Arc<dyn ClusterClient>, config: Config) -> Self {
        Self {
            cloud,
            cluster,
            config,
        }
    }

    /// Run one reconcile pass over the given ASG snapshots
    pub async fn run(&self, asgs: &[AutoScalingGroup]) -> Result<()> {
        metrics::global().node_groups.set(asgs.len() as i64);
        for asg in asgs {
            match self.reconcile_asg(asg).await {
                AsgOutcome::Continue => {}
                AsgOutcome::RolledOut => return Ok(()),
            }
        }
        Ok(())
    }

    async fn reconcile_asg(&self, asg: &AutoScalingGroup) -> AsgOutcome {
        let classification = match classify::partition_instances(self.cloud.as_ref(), asg).await {
            Ok(classification) => classification,
            Err(e) => {
                warn!(asg = %asg.name, error = %e, "skipping ASG, unable to separate outdated from updated instances");
                metrics::global().errors.inc();
                return AsgOutcome::Continue;
            }
        };
        let metric = metrics::global();
        metric
            .outdated_nodes
            .with_label_values(&[&asg.name])
            .set(classification.outdated.len() as i64);
        metric
            .updated_nodes
            .with_label_values(&[&asg.name])
            .set(classification.updated.len() as i64);
        if self.config.debug {
            debug!(asg = %asg.name, outdated = ?classification.outdated, updated = ?classification.updated, "classified instances");
        }

        let readiness = readiness::probe_updated_instances(
            self.cluster.as_ref(),
            &asg.name,
            &classification.updated,
        )
        .await;

        if classification.outdated.is_empty() {
            info!(asg = %asg.name, "all instances are up to date");
            return AsgOutcome::Continue;
        }
        info!(
            asg = %asg.name,
            outdated = classification.outdated.len(),
            updated = classification.updated.len(),
            updated_and_ready = readiness.ready_nodes.len(),
            current = asg.instances.len(),
            desired = asg.desired_capacity,
            max = asg.max_size,
            "rolling update in progress"
        );

        if (asg.instances.len() as i32) < asg.desired_capacity {
            info!(
                asg = %asg.name,
                desired = asg.desired_capacity,
                current = asg.instances.len(),
                "skipping ASG, the cloud is still materializing instances"
            );
            return AsgOutcome::Continue;
        }
        if !self.is_acceptable_non_ready(readiness.non_ready, readiness.ready_nodes.len()) {
            info!(
                asg = %asg.name,
                non_ready = readiness.non_ready,
                "waiting for non-ready updated nodes or instances"
            );
            return AsgOutcome::Continue;
        }

        if self.config.eager_cordoning {
            self.cordon_outdated_nodes(asg, &classification.outdated).await;
        }

        self.roll_outdated_instances(asg, &classification.outdated, &readiness.ready_nodes)
            .await
    }

    /// Non-ready gate: slow mode demands a fully settled pool, the default
    /// mode tolerates a small absolute-and-relative window
    fn is_acceptable_non_ready(&self, non_ready: usize, ready: usize) -> bool {
        if self.config.slow_mode {
            non_ready == 0
        } else {
            non_ready <= MAX_NON_READY && non_ready * NON_READY_PER_READY <= ready
        }
    }

    /// Cordon every outdated node up-front so scheduler pressure moves to
    /// updated nodes from the first tick of the rollout
    async fn cordon_outdated_nodes(&self, asg: &AutoScalingGroup, outdated: &[Instance]) {
        for instance in outdated {
            let node = match k8s::get_node_by_instance(self.cluster.as_ref(), instance).await {
                Ok(node) => node,
                Err(e) => {
                    warn!(asg = %asg.name, instance = %instance.instance_id, error = %e, "unable to resolve node for eager cordoning");
                    continue;
                }
            };
            let phases = RolloutPhases::from_node(&node);
            if phases.cordoned_at.is_some() {
                continue;
            }
            info!(asg = %asg.name, instance = %instance.instance_id, node = %node_name(&node), "eagerly cordoning outdated node");
            // started-at goes on before the node is made unschedulable so a
            // crash between the two leaves a correctly classified node
            if phases.started_at.is_none() {
                if let Err(e) = self.mark_rollout_started(instance).await {
                    warn!(asg = %asg.name, instance = %instance.instance_id, error = %e, "unable to annotate node before cordoning");
                    metrics::global().errors.inc();
                    continue;
                }
            }
            if let Err(e) = self.cluster.cordon(node_name(&node)).await {
                warn!(asg = %asg.name, instance = %instance.instance_id, error = %e, "unable to cordon node");
                metrics::global().errors.inc();
                continue;
            }
            if let Err(e) = k8s::annotate_node_by_instance(
                self.cluster.as_ref(),
                instance,
                ANNOTATION_ROLLING_UPDATE_CORDONED_AT,
                &k8s::now_timestamp(),
            )
            .await
            {
                warn!(asg = %asg.name, instance = %instance.instance_id, error = %e, "unable to record cordon on node");
            }
        }
    }

    async fn roll_outdated_instances(
        &self,
        asg: &AutoScalingGroup,
        outdated: &[Instance],
        ready_nodes: &[Node],
    ) -> AsgOutcome {
        for instance in outdated {
            let node = match k8s::get_node_by_instance(self.cluster.as_ref(), instance).await {
                Ok(node) => node,
                Err(e) => {
                    info!(asg = %asg.name, instance = %instance.instance_id, error = %e, "skipping instance, unable to resolve outdated node");
                    continue;
                }
            };
            let phases = RolloutPhases::from_node(&node);

            if phases.started_at.is_none() {
                info!(asg = %asg.name, instance = %instance.instance_id, node = %node_name(&node), "starting node rollout");
                if let Err(e) = self.mark_rollout_started(instance).await {
                    warn!(asg = %asg.name, instance = %instance.instance_id, error = %e, "skipping instance, unable to annotate node");
                    metrics::global().errors.inc();
                }
                continue;
            }

            debug!(asg = %asg.name, instance = %instance.instance_id, "node already started its rollout");
            let feasible =
                k8s::resources::has_enough_capacity_for(self.cluster.as_ref(), &node, ready_nodes)
                    .await;
            if feasible {
                match self.drain_and_terminate(asg, instance, &node, &phases).await {
                    Ok(true) => return AsgOutcome::RolledOut,
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(asg = %asg.name, instance = %instance.instance_id, error = %e, "skipping instance");
                        metrics::global().errors.inc();
                        continue;
                    }
                }
            } else {
                // a node already drained or terminating must not trigger
                // another capacity bump
                if phases.drained_at.is_some() || phases.terminated_at.is_some() {
                    continue;
                }
                info!(asg = %asg.name, instance = %instance.instance_id, "updated nodes lack capacity, increasing desired count by 1");
                match self.increase_desired_capacity(asg).await {
                    Ok(new_count) => {
                        metrics::global()
                            .scaled_up_nodes
                            .with_label_values(&[&asg.name])
                            .inc();
                        info!(asg = %asg.name, desired = new_count, "increased desired capacity, moving to next ASG");
                        // one bump per ASG per tick; everything after this
                        // would be reasoning over stale capacity
                        break;
                    }
                    Err(e) => {
                        warn!(asg = %asg.name, instance = %instance.instance_id, error = %e, "unable to increase desired capacity, skipping instance");
                        metrics::global().errors.inc();
                        continue;
                    }
                }
            }
        }
        AsgOutcome::Continue
    }

    /// Drain the node (if not yet drained) and terminate its instance (if
    /// not yet terminated); `Ok(true)` means a fresh drain+terminate landed
    async fn drain_and_terminate(
        &self,
        asg: &AutoScalingGroup,
        instance: &Instance,
        node: &Node,
        phases: &RolloutPhases,
    ) -> Result<bool> {
        if phases.drained_at.is_none() {
            info!(asg = %asg.name, instance = %instance.instance_id, node = %node_name(node), "draining node");
            self.cluster
                .drain(node_name(node), DrainOptions::from(&self.config))
                .await?;
            metrics::global()
                .drained_nodes
                .with_label_values(&[&asg.name])
                .inc();
            // drain cordons first, so record the cordon phase before the
            // drain phase to keep the timestamps monotone; failures here are
            // tolerated because the next tick re-reads everything
            if phases.cordoned_at.is_none() {
                let _ = k8s::annotate_node_by_instance(
                    self.cluster.as_ref(),
                    instance,
                    ANNOTATION_ROLLING_UPDATE_CORDONED_AT,
                    &k8s::now_timestamp(),
                )
                .await;
            }
            let _ = k8s::annotate_node_by_instance(
                self.cluster.as_ref(),
                instance,
                ANNOTATION_ROLLING_UPDATE_DRAINED_AT,
                &k8s::now_timestamp(),
            )
            .await;
        } else if let Some(minutes) = phases
            .drained_at
            .as_deref()
            .and_then(RolloutPhases::minutes_since)
        {
            info!(asg = %asg.name, instance = %instance.instance_id, minutes_ago = minutes, "node was already drained");
        }

        if phases.terminated_at.is_some() {
            info!(asg = %asg.name, instance = %instance.instance_id, "instance is already being terminated");
            return Ok(false);
        }

        info!(asg = %asg.name, instance = %instance.instance_id, "terminating instance");
        let decrement_desired_capacity = asg.desired_capacity != asg.min_size;
        self.cloud
            .terminate_instance(&instance.instance_id, decrement_desired_capacity)
            .await?;
        metrics::global()
            .scaled_down_nodes
            .with_label_values(&[&asg.name])
            .inc();
        let _ = k8s::annotate_node_by_instance(
            self.cluster.as_ref(),
            instance,
            ANNOTATION_ROLLING_UPDATE_TERMINATED_AT,
            &k8s::now_timestamp(),
        )
        .await;
        info!(asg = %asg.name, instance = %instance.instance_id, "node drained and scheduled for termination");
        Ok(true)
    }

    /// Record the start of a node's rollout, and pull it out of external
    /// load balancer target sets when configured
    async fn mark_rollout_started(&self, instance: &Instance) -> Result<()> {
        k8s::annotate_node_by_instance(
            self.cluster.as_ref(),
            instance,
            ANNOTATION_ROLLING_UPDATE_STARTED_AT,
            &k8s::now_timestamp(),
        )
        .await?;
        if self.config.exclude_from_external_load_balancers {
            if let Err(e) = k8s::label_node_by_instance(
                self.cluster.as_ref(),
                instance,
                LABEL_EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS,
                "true",
            )
            .await
            {
                warn!(instance = %instance.instance_id, error = %e, "unable to apply load balancer exclusion label");
            }
        }
        Ok(())
    }

    /// Raise the ASG's desired capacity by one, re-reading it first so the
    /// bump is computed against current state rather than the tick snapshot
    async fn increase_desired_capacity(&self, asg: &AutoScalingGroup) -> Result<i32> {
        let fresh = self
            .cloud
            .describe_autoscaling_group(&asg.name)
            .await?
            .ok_or_else(|| Error::cloud(format!("ASG {:?} no longer exists", asg.name)))?;
        let new_count = fresh.desired_capacity + 1;
        if new_count > fresh.max_size {
            return Err(Error::CannotIncreaseDesiredCapacityAboveMax {
                asg: fresh.name,
                max: fresh.max_size,
            });
        }
        self.cloud.set_desired_capacity(&asg.name, new_count).await?;
        Ok(new_count)
    }
}
