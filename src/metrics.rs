//! Prometheus metrics for the rollout controller
//!
//! All metrics live under the `rolling_update_handler` namespace on a
//! dedicated registry and are exposed over an optional axum listener.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::info;

use crate::error::Error;
use crate::Result;

const NAMESPACE: &str = "rolling_update_handler";

static METRICS: Lazy<Metrics> = Lazy::new(Metrics::new);

/// Handle to the process-wide metrics registry
pub fn global() -> &'static Metrics {
    &METRICS
}

/// The controller's metric surface
pub struct Metrics {
    registry: Registry,
    /// Total number of node groups managed
    pub node_groups: IntGauge,
    /// Number of outdated nodes, per node group
    pub outdated_nodes: IntGaugeVec,
    /// Number of updated nodes, per node group
    pub updated_nodes: IntGaugeVec,
    /// Total number of nodes scaled up, per node group
    pub scaled_up_nodes: IntCounterVec,
    /// Total number of nodes scaled down, per node group
    pub scaled_down_nodes: IntCounterVec,
    /// Total number of drained nodes, per node group
    pub drained_nodes: IntCounterVec,
    /// Total errors
    pub errors: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();
        let node_groups = IntGauge::with_opts(
            Opts::new("node_groups", "The total number of node groups managed").namespace(NAMESPACE),
        )
        .expect("valid node_groups gauge");
        let outdated_nodes = IntGaugeVec::new(
            Opts::new("outdated_nodes", "The number of outdated nodes").namespace(NAMESPACE),
            &["node_group"],
        )
        .expect("valid outdated_nodes gauge");
        let updated_nodes = IntGaugeVec::new(
            Opts::new("updated_nodes", "The number of updated nodes").namespace(NAMESPACE),
            &["node_group"],
        )
        .expect("valid updated_nodes gauge");
        let scaled_up_nodes = IntCounterVec::new(
            Opts::new("scaled_up_nodes", "The total number of nodes scaled up").namespace(NAMESPACE),
            &["node_group"],
        )
        .expect("valid scaled_up_nodes counter");
        let scaled_down_nodes = IntCounterVec::new(
            Opts::new("scaled_down_nodes", "The total number of nodes scaled down")
                .namespace(NAMESPACE),
            &["node_group"],
        )
        .expect("valid scaled_down_nodes counter");
        let drained_nodes = IntCounterVec::new(
            Opts::new("drained_nodes_total", "The total number of drained nodes")
                .namespace(NAMESPACE),
            &["node_group"],
        )
        .expect("valid drained_nodes counter");
        let errors = IntCounter::with_opts(
            Opts::new("errors", "The total errors").namespace(NAMESPACE),
        )
        .expect("valid errors counter");

        for collector in [
            Box::new(node_groups.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(outdated_nodes.clone()),
            Box::new(updated_nodes.clone()),
            Box::new(scaled_up_nodes.clone()),
            Box::new(scaled_down_nodes.clone()),
            Box::new(drained_nodes.clone()),
            Box::new(errors.clone()),
        ] {
            registry.register(collector).expect("unique metric names");
        }

        Self {
            registry,
            node_groups,
            outdated_nodes,
            updated_nodes,
            scaled_up_nodes,
            scaled_down_nodes,
            drained_nodes,
            errors,
        }
    }

    /// Render the registry in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

async fn metrics_handler() -> ([(&'static str, &'static str); 1], String) {
    (
        [("content-type", "text/plain; charset=utf-8")],
        global().render(),
    )
}

/// Serve `/metrics` on the given port until the process exits
pub async fn serve(port: u16) -> Result<()> {
    let app = axum::Router::new().route("/metrics", axum::routing::get(metrics_handler));
    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "metrics endpoint listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::client_setup(format!("unable to bind metrics listener: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::client_setup(format!("metrics server error: {e}")))
}
