//! Error types for the rolling-update handler

use thiserror::Error;

/// Main error type for rolling-update operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration; fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// AWS API error (AutoScaling or EC2)
    #[error("cloud error: {0}")]
    Cloud(String),

    /// Failure constructing an API client at startup
    #[error("client setup error: {0}")]
    ClientSetup(String),

    /// No Kubernetes node matches the instance's provider id
    #[error("node with provider id {0:?} not found")]
    NodeNotFound(String),

    /// The ASG declares neither a launch template nor a launch configuration
    #[error("auto-scaling group {0:?} has neither launch template nor launch configuration")]
    NoTemplateSource(String),

    /// The launch template referenced by the ASG could not be described
    #[error("launch template {0:?} not found")]
    LaunchTemplateNotFound(String),

    /// Raising desired capacity would exceed the ASG's max size
    #[error("cannot increase desired capacity of {asg:?} above max size {max}")]
    CannotIncreaseDesiredCapacityAboveMax {
        /// ASG whose growth is blocked
        asg: String,
        /// The ASG's configured max size
        max: i32,
    },

    /// Node drain failed or exceeded its time budget
    #[error("drain of node {node:?} failed: {reason}")]
    Drain {
        /// Node that was being drained
        node: String,
        /// Human-readable failure description
        reason: String,
    },

    /// A reconcile pass exceeded the execution timeout
    #[error("execution timed out")]
    TimedOut,

    /// The reconcile task ended without producing a result
    #[error("execution error: {0}")]
    Execution(String),

    /// Too many consecutive failed passes; the process must terminate
    #[error("execution failed {0} consecutive times")]
    TooManyConsecutiveFailures(u32),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a cloud error with the given message
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud(msg.into())
    }

    /// Create a client-setup error with the given message
    pub fn client_setup(msg: impl Into<String>) -> Self {
        Self::ClientSetup(msg.into())
    }

    /// Create a drain error for the given node
    pub fn drain(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Drain {
            node: node.into(),
            reason: reason.into(),
        }
    }
}
