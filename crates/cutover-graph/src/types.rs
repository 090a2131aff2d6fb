//! Stack identifiers, statuses and nodes

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a deployable stack (`network`, `database`, ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackId(String);

impl StackId {
    /// Create a stack id
    #[inline]
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as `&str`
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StackId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StackId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&StackId> for StackId {
    fn from(value: &StackId) -> Self {
        value.clone()
    }
}

impl Borrow<str> for StackId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Provisioning status of a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    /// Declared, not yet submitted
    Pending,
    /// Submitted to the provisioner
    InProgress,
    /// Provisioned; outputs available
    Ready,
    /// Provisioning failed; blocks every dependent until retried
    Failed,
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A node of the stack graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackNode {
    /// Stack identifier
    pub id: StackId,
    /// Dependencies, in declaration order
    pub depends_on: Vec<StackId>,
    /// Current provisioning status
    pub status: StackStatus,
    /// Exported outputs, populated on `Ready`
    pub outputs: BTreeMap<String, String>,
    /// Reason of the last provisioning failure
    pub failure: Option<String>,
}

impl StackNode {
    pub(crate) fn new(id: StackId, depends_on: Vec<StackId>) -> Self {
        Self {
            id,
            depends_on,
            status: StackStatus::Pending,
            outputs: BTreeMap::new(),
            failure: None,
        }
    }

    /// Whether the node is `Ready`
    #[inline]
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == StackStatus::Ready
    }
}
