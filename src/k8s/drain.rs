//! Eviction-based node drain
//!
//! The Kubernetes API has no server-side drain; the node is cordoned and its
//! pods are removed through the Eviction subresource so PodDisruptionBudgets
//! are respected. Evictions run in a bounded number of parallel streams and
//! a budget-blocked eviction (429) is retried until the drain budget runs
//! out.
//!
//! Pods are selected the way `kubectl drain` selects them:
//! - completed (`Succeeded`/`Failed`) pods are left alone
//! - static mirror pods cannot be controlled and are skipped
//! - DaemonSet pods are skipped when `ignore_daemon_sets` is set and refuse
//!   the drain otherwise, since their controller ignores cordons
//! - pods with emptyDir volumes refuse the drain unless
//!   `delete_empty_dir_data` allows losing that data
//! - unreplicated pods are evicted without further ceremony

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, EvictParams, ListParams};
use kube::Client;
use tracing::{info, warn};

use crate::k8s::DrainOptions;
use crate::error::Error;
use crate::Result;

/// Overall budget for draining one node
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(300);

// Keeping concurrency low avoids hammering the API server; waiting for pod
// deletion counts against the same slots.
const CONCURRENT_EVICTIONS: usize = 5;

// kubectl drain waits 5 seconds between attempts while a PodDisruptionBudget
// blocks an eviction; we follow suit.
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Evict all evictable pods from a cordoned node, within [`DRAIN_TIMEOUT`]
pub async fn evict_node_pods(client: &Client, node_name: &str, options: DrainOptions) -> Result<()> {
    match tokio::time::timeout(DRAIN_TIMEOUT, drain_pods(client, node_name, options)).await {
        Ok(result) => result,
        Err(_) => Err(Error::drain(
            node_name,
            format!("timed out after {}s", DRAIN_TIMEOUT.as_secs()),
        )),
    }
}

async fn drain_pods(client: &Client, node_name: &str, options: DrainOptions) -> Result<()> {
    let pods: Api<Pod> = Api::all(client.clone());
    let listing = pods
        .list(&ListParams::default().fields(&format!("spec.nodeName={node_name}")))
        .await?;
    let targets = select_pods_for_eviction(listing.items, node_name, options)?;
    if targets.is_empty() {
        info!(node = %node_name, "no pods to evict");
        return Ok(());
    }

    let failed = AtomicUsize::new(0);
    let total = targets.len();
    stream::iter(targets)
        .for_each_concurrent(CONCURRENT_EVICTIONS, |pod| {
            let failed = &failed;
            async move {
                match evict_pod(client, node_name, &pod, options.grace_period_seconds).await {
                    Ok(()) => {
                        // Deletions that outlive the drain budget are caught by
                        // the caller's timeout, not here.
                        wait_for_deletion(client, &pod).await;
                    }
                    Err(e) => {
                        warn!(node = %node_name, pod = %pod_ref(&pod), error = %e, "eviction failed");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        })
        .await;

    let failed = failed.load(Ordering::Relaxed);
    if failed > 0 {
        return Err(Error::drain(
            node_name,
            format!("{failed} of {total} evictions failed"),
        ));
    }
    Ok(())
}

/// Apply the kubectl-style pod selection rules; errors refuse the drain
fn select_pods_for_eviction(
    pods: Vec<Pod>,
    node_name: &str,
    options: DrainOptions,
) -> Result<Vec<Pod>> {
    let mut targets = Vec::new();
    for pod in pods {
        if is_finished(&pod) || is_mirror_pod(&pod) {
            continue;
        }
        if is_daemon_set_pod(&pod) {
            if options.ignore_daemon_sets {
                continue;
            }
            return Err(Error::drain(
                node_name,
                format!("cannot evict DaemonSet-managed pod {}", pod_ref(&pod)),
            ));
        }
        if has_empty_dir_volume(&pod) && !options.delete_empty_dir_data {
            return Err(Error::drain(
                node_name,
                format!("cannot evict pod {} with emptyDir volume", pod_ref(&pod)),
            ));
        }
        targets.push(pod);
    }
    Ok(targets)
}

async fn evict_pod(
    client: &Client,
    node_name: &str,
    pod: &Pod,
    grace_period_seconds: Option<i64>,
) -> Result<()> {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = EvictParams {
        delete_options: grace_period_seconds.map(|seconds| DeleteParams {
            grace_period_seconds: Some(seconds.max(0) as u32),
            ..Default::default()
        }),
        ..Default::default()
    };
    loop {
        match pods.evict(name, &params).await {
            Ok(_) => {
                info!(node = %node_name, pod = %pod_ref(pod), "evicted pod");
                return Ok(());
            }
            // the pod disappeared on its own, which is the outcome we wanted
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(()),
            // 429: a PodDisruptionBudget is blocking this eviction right now
            Err(kube::Error::Api(response)) if response.code == 429 => {
                tokio::time::sleep(EVICTION_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn wait_for_deletion(client: &Client, pod: &Pod) {
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let name = pod.metadata.name.as_deref().unwrap_or_default();
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    loop {
        match pods.get(name).await {
            Err(kube::Error::Api(response)) if response.code == 404 => return,
            Ok(current) if current.metadata.uid != pod.metadata.uid => return,
            // Transient errors and still-terminating pods both mean "check again"
            _ => tokio::time::sleep(DELETION_CHECK_INTERVAL).await,
        }
    }
}

fn pod_ref(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

fn is_finished(pod: &Pod) -> bool {
    matches!(
        pod.status
            .as_ref()
            .and_then(|status| status.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(MIRROR_POD_ANNOTATION))
}

fn is_daemon_set_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|owner| owner.kind == "DaemonSet"))
}

fn has_empty_dir_volume(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|volume| volume.empty_dir.is_some()))
}
