//! Environment-driven configuration
//!
//! All tunables come from environment variables, resolved once at startup
//! into an immutable [`Config`] that is threaded through constructors.
//! Tests build a [`Config`] by hand or feed [`Config::from_lookup`] a map.

use std::collections::HashMap;
use std::time::Duration;

use tracing::warn;

use crate::cloud::{TagFilter, TAG_CLUSTER_AUTOSCALER_ENABLED};
use crate::error::Error;
use crate::Result;

/// `ENVIRONMENT`: free-form tag; `dev` selects local kubeconfig credentials
pub const ENV_ENVIRONMENT: &str = "ENVIRONMENT";
/// `DEBUG`: verbose diagnostics when `true`
pub const ENV_DEBUG: &str = "DEBUG";
/// `IGNORE_DAEMON_SETS`: drain flag, skip DaemonSet pods (default `true`)
pub const ENV_IGNORE_DAEMON_SETS: &str = "IGNORE_DAEMON_SETS";
/// `DELETE_LOCAL_DATA`: deprecated alias for `DELETE_EMPTY_DIR_DATA`
pub const ENV_DELETE_LOCAL_DATA: &str = "DELETE_LOCAL_DATA";
/// `DELETE_EMPTY_DIR_DATA`: drain flag, allow deleting pods with emptyDir volumes (default `true`)
pub const ENV_DELETE_EMPTY_DIR_DATA: &str = "DELETE_EMPTY_DIR_DATA";
/// `CLUSTER_NAME`: shorthand that expands to the EKS cluster-autoscaler tag pair
pub const ENV_CLUSTER_NAME: &str = "CLUSTER_NAME";
/// `AUTODISCOVERY_TAGS`: comma-separated `k=v` tag filters for ASG discovery
pub const ENV_AUTODISCOVERY_TAGS: &str = "AUTODISCOVERY_TAGS";
/// `AUTO_SCALING_GROUP_NAMES`: comma-separated explicit ASG names
pub const ENV_AUTO_SCALING_GROUP_NAMES: &str = "AUTO_SCALING_GROUP_NAMES";
/// `AWS_REGION`: cloud region (default `us-west-2`)
pub const ENV_AWS_REGION: &str = "AWS_REGION";
/// `EXECUTION_INTERVAL`: seconds between ticks (default 20)
pub const ENV_EXECUTION_INTERVAL: &str = "EXECUTION_INTERVAL";
/// `EXECUTION_TIMEOUT`: seconds per tick (default 900)
pub const ENV_EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";
/// `POD_TERMINATION_GRACE_PERIOD`: drain grace period; `-1` keeps the pod's own
pub const ENV_POD_TERMINATION_GRACE_PERIOD: &str = "POD_TERMINATION_GRACE_PERIOD";
/// `METRICS`: enable the Prometheus endpoint when `true`
pub const ENV_METRICS: &str = "METRICS";
/// `METRICS_PORT`: Prometheus endpoint port (default 8080)
pub const ENV_METRICS_PORT: &str = "METRICS_PORT";
/// `SLOW_MODE`: require zero non-ready updated nodes before progressing
pub const ENV_SLOW_MODE: &str = "SLOW_MODE";
/// `EAGER_CORDONING`: cordon all outdated nodes up-front
pub const ENV_EAGER_CORDONING: &str = "EAGER_CORDONING";
/// `EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS`: label nodes out of external LBs on rollout start
pub const ENV_EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS: &str = "EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS";

const DEFAULT_AWS_REGION: &str = "us-west-2";
const DEFAULT_EXECUTION_INTERVAL_SECONDS: u64 = 20;
const DEFAULT_EXECUTION_TIMEOUT_SECONDS: u64 = 900;
const DEFAULT_METRICS_PORT: u16 = 8080;

/// How the set of managed ASGs is discovered each tick
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Discovery {
    /// Keep ASGs whose tags contain every listed `k=v` pair
    Tags(Vec<TagFilter>),
    /// Describe exactly these ASGs by name
    Names(Vec<String>),
}

/// Immutable application configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Free-form environment tag; `dev` selects local kubeconfig credentials
    pub environment: String,
    /// Verbose diagnostics
    pub debug: bool,
    /// ASG discovery mode
    pub discovery: Discovery,
    /// AWS region for the AutoScaling and EC2 clients
    pub aws_region: String,
    /// Drain flag: skip DaemonSet pods
    pub ignore_daemon_sets: bool,
    /// Drain flag: allow deleting pods with emptyDir volumes
    pub delete_empty_dir_data: bool,
    /// Delay between reconcile passes
    pub execution_interval: Duration,
    /// Budget for a single reconcile pass
    pub execution_timeout: Duration,
    /// Drain grace period in seconds; negative keeps each pod's own
    pub pod_termination_grace_period: i64,
    /// Serve the Prometheus endpoint
    pub metrics: bool,
    /// Prometheus endpoint port
    pub metrics_port: u16,
    /// Require zero non-ready updated nodes before progressing
    pub slow_mode: bool,
    /// Cordon all outdated nodes at the start of a rollout
    pub eager_cordoning: bool,
    /// Apply the exclude-from-external-load-balancers label on rollout start
    pub exclude_from_external_load_balancers: bool,
}

impl Config {
    /// Resolve configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary variable lookup
    ///
    /// Exactly one of `CLUSTER_NAME`, `AUTODISCOVERY_TAGS` and
    /// `AUTO_SCALING_GROUP_NAMES` must be supplied; they are evaluated in
    /// that precedence order and the first hit wins.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let discovery = if let Some(cluster_name) = non_empty(&lookup, ENV_CLUSTER_NAME) {
            // See "Prerequisites" in the EKS cluster-autoscaler documentation
            let tags = format!(
                "k8s.io/cluster-autoscaler/{cluster_name}=owned,{TAG_CLUSTER_AUTOSCALER_ENABLED}=true"
            );
            Discovery::Tags(TagFilter::parse_list(&tags)?)
        } else if let Some(tags) = non_empty(&lookup, ENV_AUTODISCOVERY_TAGS) {
            Discovery::Tags(TagFilter::parse_list(&tags)?)
        } else if let Some(names) = non_empty(&lookup, ENV_AUTO_SCALING_GROUP_NAMES) {
            Discovery::Names(names.trim().split(',').map(str::to_string).collect())
        } else {
            return Err(Error::config(format!(
                "one of '{ENV_CLUSTER_NAME}', '{ENV_AUTODISCOVERY_TAGS}' or '{ENV_AUTO_SCALING_GROUP_NAMES}' must be set"
            )));
        };
        let delete_empty_dir_data = match non_empty(&lookup, ENV_DELETE_LOCAL_DATA) {
            Some(deprecated) => {
                warn!(
                    "'{ENV_DELETE_LOCAL_DATA}' has been deprecated in favor of '{ENV_DELETE_EMPTY_DIR_DATA}' \
                     and will be removed in a future release"
                );
                if let Some(current) = non_empty(&lookup, ENV_DELETE_EMPTY_DIR_DATA) {
                    warn!(
                        "both '{ENV_DELETE_LOCAL_DATA}' and '{ENV_DELETE_EMPTY_DIR_DATA}' are set; \
                         the former is deprecated and will be ignored"
                    );
                    default_true(Some(current))
                } else {
                    default_true(Some(deprecated))
                }
            }
            None => default_true(non_empty(&lookup, ENV_DELETE_EMPTY_DIR_DATA)),
        };
        Ok(Self {
            environment: lookup(ENV_ENVIRONMENT).unwrap_or_default().to_lowercase(),
            debug: is_true(&lookup, ENV_DEBUG),
            discovery,
            aws_region: non_empty(&lookup, ENV_AWS_REGION)
                .map(|region| region.to_lowercase())
                .unwrap_or_else(|| DEFAULT_AWS_REGION.to_string()),
            ignore_daemon_sets: default_true(non_empty(&lookup, ENV_IGNORE_DAEMON_SETS)),
            delete_empty_dir_data,
            execution_interval: Duration::from_secs(seconds_var(
                &lookup,
                ENV_EXECUTION_INTERVAL,
                DEFAULT_EXECUTION_INTERVAL_SECONDS,
            )?),
            execution_timeout: Duration::from_secs(seconds_var(
                &lookup,
                ENV_EXECUTION_TIMEOUT,
                DEFAULT_EXECUTION_TIMEOUT_SECONDS,
            )?),
            pod_termination_grace_period: integer_var(&lookup, ENV_POD_TERMINATION_GRACE_PERIOD, -1)?,
            metrics: is_true(&lookup, ENV_METRICS),
            metrics_port: integer_var(&lookup, ENV_METRICS_PORT, DEFAULT_METRICS_PORT)?,
            slow_mode: is_true(&lookup, ENV_SLOW_MODE),
            eager_cordoning: is_true(&lookup, ENV_EAGER_CORDONING),
            exclude_from_external_load_balancers: is_true(
                &lookup,
                ENV_EXCLUDE_FROM_EXTERNAL_LOAD_BALANCERS,
            ),
        })
    }

    /// Resolve configuration from a map of variables (test helper)
    pub fn from_map(vars: &HashMap<&str, &str>) -> Result<Self> {
        Self::from_lookup(|key| vars.get(key).map(|value| value.to_string()))
    }

    /// Grace period to pass to the eviction API; `None` keeps each pod's own
    pub fn drain_grace_period(&self) -> Option<i64> {
        (self.pod_termination_grace_period >= 0).then_some(self.pod_termination_grace_period)
    }
}

fn non_empty(lookup: impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|value| !value.is_empty())
}

fn is_true(lookup: impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key).is_some_and(|value| value.to_lowercase() == "true")
}

/// Unset and `"true"` are truthy; anything else is false
fn default_true(value: Option<String>) -> bool {
    match value {
        None => true,
        Some(value) => value.to_lowercase() == "true",
    }
}

fn seconds_var(lookup: impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    integer_var(lookup, key, default)
}

fn integer_var<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match non_empty(lookup, key) {
        Some(value) => value
            .parse()
            .map_err(|_| Error::config(format!("environment variable '{key}' must be an integer"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([(ENV_AUTO_SCALING_GROUP_NAMES, "asg-1,asg-2")])
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_map(&base_vars()).unwrap();
        assert_eq!(
            cfg.discovery,
            Discovery::Names(vec!["asg-1".to_string(), "asg-2".to_string()])
        );
        assert_eq!(cfg.aws_region, "us-west-2");
        assert!(cfg.ignore_daemon_sets);
        assert!(cfg.delete_empty_dir_data);
        assert_eq!(cfg.execution_interval, Duration::from_secs(20));
        assert_eq!(cfg.execution_timeout, Duration::from_secs(900));
        assert_eq!(cfg.pod_termination_grace_period, -1);
        assert_eq!(cfg.drain_grace_period(), None);
        assert!(!cfg.metrics);
        assert_eq!(cfg.metrics_port, 8080);
        assert!(!cfg.slow_mode);
        assert!(!cfg.eager_cordoning);
        assert!(!cfg.exclude_from_external_load_balancers);
    }

    #[test]
    fn test_missing_discovery_is_fatal() {
        let err = Config::from_map(&HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_cluster_name_expands_to_autoscaler_tags() {
        let vars = HashMap::from([(ENV_CLUSTER_NAME, "production")]);
        let cfg = Config::from_map(&vars).unwrap();
        assert_eq!(
            cfg.discovery,
            Discovery::Tags(vec![
                TagFilter::new("k8s.io/cluster-autoscaler/production", "owned"),
                TagFilter::new("k8s.io/cluster-autoscaler/enabled", "true"),
            ])
        );
    }

    #[test]
    fn test_cluster_name_takes_precedence_over_tags_and_names() {
        let vars = HashMap::from([
            (ENV_CLUSTER_NAME, "prod"),
            (ENV_AUTODISCOVERY_TAGS, "team=infra"),
            (ENV_AUTO_SCALING_GROUP_NAMES, "asg-1"),
        ]);
        let cfg = Config::from_map(&vars).unwrap();
        assert!(matches!(cfg.discovery, Discovery::Tags(ref filters) if filters.len() == 2));
    }

    #[test]
    fn test_autodiscovery_tags_take_precedence_over_names() {
        let vars = HashMap::from([
            (ENV_AUTODISCOVERY_TAGS, "team=infra,env=prod"),
            (ENV_AUTO_SCALING_GROUP_NAMES, "asg-1"),
        ]);
        let cfg = Config::from_map(&vars).unwrap();
        assert_eq!(
            cfg.discovery,
            Discovery::Tags(vec![
                TagFilter::new("team", "infra"),
                TagFilter::new("env", "prod"),
            ])
        );
    }

    #[test]
    fn test_boolean_flags() {
        let mut vars = base_vars();
        vars.insert(ENV_DEBUG, "true");
        vars.insert(ENV_SLOW_MODE, "TRUE");
        vars.insert(ENV_EAGER_CORDONING, "true");
        vars.insert(ENV_METRICS, "true");
        vars.insert(ENV_IGNORE_DAEMON_SETS, "false");
        let cfg = Config::from_map(&vars).unwrap();
        assert!(cfg.debug);
        assert!(cfg.slow_mode);
        assert!(cfg.eager_cordoning);
        assert!(cfg.metrics);
        assert!(!cfg.ignore_daemon_sets);
    }

    #[test]
    fn test_deprecated_delete_local_data_is_honored_when_new_name_is_unset() {
        let mut vars = base_vars();
        vars.insert(ENV_DELETE_LOCAL_DATA, "false");
        let cfg = Config::from_map(&vars).unwrap();
        assert!(!cfg.delete_empty_dir_data);
    }

    #[test]
    fn test_new_name_wins_over_deprecated_delete_local_data() {
        let mut vars = base_vars();
        vars.insert(ENV_DELETE_LOCAL_DATA, "false");
        vars.insert(ENV_DELETE_EMPTY_DIR_DATA, "true");
        let cfg = Config::from_map(&vars).unwrap();
        assert!(cfg.delete_empty_dir_data);
    }

    #[test]
    fn test_intervals_and_grace_period() {
        let mut vars = base_vars();
        vars.insert(ENV_EXECUTION_INTERVAL, "5");
        vars.insert(ENV_EXECUTION_TIMEOUT, "60");
        vars.insert(ENV_POD_TERMINATION_GRACE_PERIOD, "30");
        let cfg = Config::from_map(&vars).unwrap();
        assert_eq!(cfg.execution_interval, Duration::from_secs(5));
        assert_eq!(cfg.execution_timeout, Duration::from_secs(60));
        assert_eq!(cfg.drain_grace_period(), Some(30));
    }

    #[test]
    fn test_non_integer_interval_is_fatal() {
        let mut vars = base_vars();
        vars.insert(ENV_EXECUTION_INTERVAL, "twenty");
        assert!(Config::from_map(&vars).is_err());
    }

    #[test]
    fn test_non_integer_metrics_port_is_fatal() {
        let mut vars = base_vars();
        vars.insert(ENV_METRICS_PORT, "http");
        assert!(Config::from_map(&vars).is_err());
    }
}
