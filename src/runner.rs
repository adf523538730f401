//! The tick driver
//!
//! Runs reconcile passes forever, one at a time: each pass races a watchdog
//! timer, passes are spaced by the configured interval, and consecutive
//! failures above a threshold terminate the process so the orchestrator
//! restarts it with a clean slate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info};

use crate::cloud::CloudProvider;
use crate::config::{Config, Discovery};
use crate::k8s::ClusterClient;
use crate::error::Error;
use crate::metrics;
use crate::rollout::Reconciler;
use crate::Result;

/// Consecutive failed passes tolerated before the process gives up
pub const MAXIMUM_FAILED_EXECUTIONS: u32 = 10;

/// Discover the managed ASGs and run one reconcile pass over them
pub async fn tick(
    cloud: Arc<dyn CloudProvider>,
    cluster: Arc<dyn ClusterClient>,
    config: Config,
) -> Result<()> {
    let asgs = match &config.discovery {
        Discovery::Names(names) => cloud.describe_autoscaling_groups_by_names(names).await?,
        Discovery::Tags(filters) => cloud.describe_autoscaling_groups_by_tags(filters).await?,
    };
    Reconciler::new(cloud.clone(), cluster, config).run(&asgs).await
}

/// Race a reconcile pass against a watchdog timer
///
/// The first to finish decides the outcome. A pass that loses the race is
/// detached rather than force-cancelled: in-flight cloud and cluster calls
/// may finish, but their result is ignored for this tick.
pub async fn execute_with_timeout<F>(timeout: Duration, work: F) -> Result<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let work = tokio::spawn(work);
    tokio::select! {
        _ = tokio::time::sleep(timeout) => Err(Error::TimedOut),
        result = work => {
            result.map_err(|e| Error::Execution(format!("reconcile task died: {e}")))?
        }
    }
}

/// Forever-loop over reconcile passes
pub struct Runner {
    cloud: Arc<dyn CloudProvider>,
    cluster: Arc<dyn ClusterClient>,
    config: Config,
    consecutive_failures: u32,
}

impl Runner {
    /// Create a runner over the given capability handles
    pub fn new(cloud: Arc<dyn CloudProvider>, cluster: Arc<dyn ClusterClient>, config: Config) -> Self {
        Self {
            cloud,
            cluster,
            config,
            consecutive_failures: 0,
        }
    }

    /// Loop until the consecutive-failure threshold is exceeded
    ///
    /// Only returns the fatal error; everything else is logged and retried
    /// after the execution interval.
    pub async fn run_forever(&mut self) -> Error {
        loop {
            let started = Instant::now();
            info!("starting execution");
            let outcome = execute_with_timeout(
                self.config.execution_timeout,
                tick(self.cloud.clone(), self.cluster.clone(), self.config.clone()),
            )
            .await;
            if let Err(fatal) = self.register_outcome(outcome) {
                return fatal;
            }
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                sleeping_s = self.config.execution_interval.as_secs(),
                "execution finished"
            );
            tokio::time::sleep(self.config.execution_interval).await;
        }
    }

    /// Track one pass's outcome against the failure threshold
    fn register_outcome(&mut self, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    info!(
                        failed_attempts = self.consecutive_failures,
                        "execution succeeded again, resetting failure counter"
                    );
                }
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                error!(
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "error during execution"
                );
                metrics::global().errors.inc();
                if self.consecutive_failures > MAXIMUM_FAILED_EXECUTIONS {
                    Err(Error::TooManyConsecutiveFailures(self.consecutive_failures))
                } else {
                    Ok(())
                }
            }
        }
    }
}
