//! Production cluster client backed by kube-rs
//!
//! Node listings are served from a short-lived in-process cache to keep the
//! per-tick API load down; every write path invalidates it. Reconciler
//! correctness does not depend on the cache.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, ListParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tracing::debug;

use crate::k8s::{drain, node_name, ClusterClient, DrainOptions};
use crate::error::Error;
use crate::Result;

const NODE_CACHE_TTL: Duration = Duration::from_secs(10);

struct CachedNodes {
    fetched_at: Instant,
    nodes: Vec<Node>,
}

/// [`ClusterClient`] implementation over a kube-rs [`Client`]
pub struct KubernetesClient {
    client: Client,
    node_cache: tokio::sync::Mutex<Option<CachedNodes>>,
}

impl KubernetesClient {
    /// Wrap an existing kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            node_cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Build a client for the given environment
    ///
    /// `dev` reads the local kubeconfig; anything else assumes the process
    /// runs inside the cluster and uses the service-account token.
    pub async fn create(environment: &str) -> Result<Self> {
        let config = if environment == "dev" {
            Config::from_kubeconfig(&KubeConfigOptions::default())
                .await
                .map_err(|e| Error::client_setup(format!("unable to load kubeconfig: {e}")))?
        } else {
            Config::incluster()
                .map_err(|e| Error::client_setup(format!("unable to load in-cluster config: {e}")))?
        };
        let client = Client::try_from(config)
            .map_err(|e| Error::client_setup(format!("unable to create Kubernetes client: {e}")))?;
        Ok(Self::new(client))
    }

    fn nodes_api(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    async fn invalidate_node_cache(&self) {
        *self.node_cache.lock().await = None;
    }
}

#[async_trait]
impl ClusterClient for KubernetesClient {
    async fn get_nodes(&self) -> Result<Vec<Node>> {
        let mut cache = self.node_cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < NODE_CACHE_TTL {
                return Ok(cached.nodes.clone());
            }
        }
        let nodes = self.nodes_api().list(&ListParams::default()).await?.items;
        debug!(count = nodes.len(), "refreshed node cache");
        *cache = Some(CachedNodes {
            fetched_at: Instant::now(),
            nodes: nodes.clone(),
        });
        Ok(nodes)
    }

    async fn get_pods_in_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let listing = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={node_name}")))
            .await?;
        Ok(listing.items)
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        let name = node_name(node).to_string();
        self.nodes_api()
            .replace(&name, &PostParams::default(), node)
            .await?;
        self.invalidate_node_cache().await;
        Ok(())
    }

    async fn cordon(&self, node_name: &str) -> Result<()> {
        self.nodes_api().cordon(node_name).await?;
        self.invalidate_node_cache().await;
        Ok(())
    }

    async fn drain(&self, node_name: &str, options: DrainOptions) -> Result<()> {
        self.cordon(node_name).await?;
        let result = drain::evict_node_pods(&self.client, node_name, options).await;
        self.invalidate_node_cache().await;
        result
    }
}
