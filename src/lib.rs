//! asg-roller - rolling replacement of outdated auto-scaling-group nodes
//!
//! A control loop that detects worker nodes launched from a stale launch
//! template, launch configuration or mixed-instances override set, and
//! cycles them out one by one: temporarily grow the pool so a replacement
//! joins, drain the outdated node once the replacements can absorb its
//! workload, then terminate the backing instance. Rollout state is persisted
//! as node annotations, so the process itself is stateless and restartable.
//!
//! It coexists with the cluster autoscaler and defers capacity math to it.
//!
//! # Modules
//!
//! - [`cloud`] - Cloud capability set (ASGs, launch templates) and AWS impl
//! - [`k8s`] - Cluster capability set, annotation store, drain, resources
//! - [`rollout`] - Instance classification, readiness and the reconciler
//! - [`runner`] - Tick loop with watchdog timeout and failure threshold
//! - [`config`] - Environment configuration
//! - [`metrics`] - Prometheus surface
//! - [`error`] - Error types
//! - [`testing`] - In-memory fakes for the test suites

#![deny(missing_docs)]

pub mod cloud;
pub mod config;
pub mod error;
pub mod k8s;
pub mod metrics;
pub mod rollout;
pub mod runner;
pub mod testing;

pub use error::Error;

/// Result type alias for rolling-update operations
pub type Result<T, E = Error> = std::result::Result<T, E>;
