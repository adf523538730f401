//! asg-roller - process bootstrap

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use asg_roller::cloud::AwsCloudProvider;
use asg_roller::config::Config;
use asg_roller::k8s::KubernetesClient;
use asg_roller::metrics;
use asg_roller::runner::Runner;

#[tokio::main]
async fn main() {
    // the filter default needs to exist before the config is parsed, since
    // config parsing already emits deprecation notices
    let default_level = match std::env::var("DEBUG") {
        Ok(value) if value.to_lowercase() == "true" => "debug",
        _ => "info",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "unable to initialize configuration");
            std::process::exit(1);
        }
    };
    info!(
        region = %config.aws_region,
        discovery = ?config.discovery,
        "configuration loaded"
    );

    let cloud = AwsCloudProvider::new(&config.aws_region).await;
    let cluster = match KubernetesClient::create(&config.environment).await {
        Ok(cluster) => cluster,
        Err(e) => {
            error!(error = %e, "unable to create Kubernetes client");
            std::process::exit(1);
        }
    };

    if config.metrics {
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(port).await {
                error!(error = %e, "metrics server terminated");
            }
        });
    }

    let mut runner = Runner::new(Arc::new(cloud), Arc::new(cluster), config);
    let fatal = runner.run_forever().await;
    error!(error = %fatal, "terminating so the orchestrator can restart with a clean slate");
    std::process::exit(1);
}
