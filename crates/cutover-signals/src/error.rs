//! Signal and adapter errors

use crate::health::Environment;
use std::time::Duration;

/// Failure reported by an external collaborator (provisioner, replication
/// API, health endpoint, traffic router)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The collaborator could not be reached or answered with a transient fault
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The collaborator refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    /// No answer within the allotted time
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl AdapterError {
    /// Whether retrying the same call can succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

/// Replication monitor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicationError {
    /// `start` was called on a monitor that is already polling
    #[error("replication monitor already running")]
    AlreadyRunning,

    /// No poll has succeeded yet
    #[error("replication lag unknown: no successful poll yet")]
    LagUnknown,

    /// The status adapter failed
    #[error("replication status poll failed: {0}")]
    Adapter(#[from] AdapterError),
}

/// Health probe errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthError {
    /// Too few snapshots in the window to judge; callers must treat this as
    /// "not yet safe", never as healthy
    #[error("insufficient health data for {env}: {available} samples, need {required}")]
    InsufficientData {
        /// Environment queried
        env: Environment,
        /// Snapshots inside the window
        available: usize,
        /// Configured minimum
        required: usize,
    },
}
