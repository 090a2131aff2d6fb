//! Error types for the orchestrator
//!
//! - Plan and settings problems ([`ConfigError`])
//! - Run persistence failures ([`StoreError`])
//! - Run-level failures ([`OrchestratorError`])

use cutover_graph::{GraphError, StackId};
use cutover_signals::ReplicationError;
use cutover_traffic::TrafficError;
use std::path::PathBuf;

/// Main orchestrator error type
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Stack graph construction or bookkeeping failed
    #[error("stack graph error: {0}")]
    Graph(#[from] GraphError),

    /// A stack could not be provisioned; stacks already `Ready` are untouched
    #[error("provisioning failed for stack {node}: {reason}")]
    ProvisioningFailed {
        /// Failed stack
        node: StackId,
        /// Provisioner's last error
        reason: String,
    },

    /// Traffic controller error
    #[error("traffic error: {0}")]
    Traffic(#[from] TrafficError),

    /// Replication monitor error
    #[error("replication error: {0}")]
    Replication(#[from] ReplicationError),

    /// Run persistence failed
    #[error("run store error: {0}")]
    Store(#[from] StoreError),

    /// Plan or settings are unusable
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Whether the run failed on a configuration mistake and retrying the
    /// same plan cannot help
    #[inline]
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        match self {
            Self::Graph(err) => err.is_configuration_error(),
            Self::Config(_) => true,
            Self::Traffic(TrafficError::InvalidPlan(_) | TrafficError::InvalidWeight { .. }) => {
                true
            }
            _ => false,
        }
    }
}

/// Plan and settings errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Plan file could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Plan file is not valid TOML for a plan
    #[error("cannot parse plan: {0}")]
    Parse(#[from] toml::de::Error),

    /// A setting is out of range
    #[error("invalid setting {field}: {reason}")]
    InvalidSetting {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },

    /// The stack list does not form a usable graph
    #[error("invalid stack graph: {0}")]
    Graph(#[from] GraphError),

    /// The phase list is unusable
    #[error("invalid phases: {0}")]
    Phases(#[from] TrafficError),
}

impl ConfigError {
    /// Convenience constructor for out-of-range settings
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field,
            reason: reason.into(),
        }
    }
}

/// Run persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure
    #[error("i/o error on {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Stored record is not a valid run
    #[error("malformed run record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Refused to overwrite a newer record
    #[error("stale run for plan {plan}: stored sequence {stored}, attempted {attempted}")]
    StaleSequence {
        /// Plan name
        plan: String,
        /// Sequence already stored
        stored: u64,
        /// Sequence that was rejected
        attempted: u64,
    },

    /// Plan name cannot be used as a file name
    #[error("plan name {0:?} is not a valid record key")]
    InvalidKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_errors_are_not_retryable() {
        let cycle = OrchestratorError::Graph(GraphError::CycleDetected(StackId::from("network")));
        assert!(cycle.is_configuration_error());

        let failed = OrchestratorError::ProvisioningFailed {
            node: StackId::from("database"),
            reason: "quota".into(),
        };
        assert!(!failed.is_configuration_error());
        assert_eq!(
            failed.to_string(),
            "provisioning failed for stack database: quota"
        );
    }
}
