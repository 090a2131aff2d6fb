//! Stack graph errors

use crate::types::{StackId, StackStatus};

/// Errors raised by [`crate::StackGraph`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Adding the node (or walking the graph) found a dependency cycle
    #[error("dependency cycle through stack '{0}'")]
    CycleDetected(StackId),

    /// A node with this id was already added
    #[error("stack '{0}' already exists")]
    DuplicateNode(StackId),

    /// No node with this id was added
    #[error("unknown stack '{0}'")]
    UnknownNode(StackId),

    /// A dependency of the stack is not `Ready`
    #[error("stack '{stack}' depends on '{dependency}' which is not ready")]
    DependencyNotReady {
        /// Stack being transitioned
        stack: StackId,
        /// First dependency found not ready
        dependency: StackId,
    },

    /// The producer is not `Ready` or does not export the key
    #[error("output '{key}' not available from stack '{stack}'")]
    OutputNotFound {
        /// Producer stack
        stack: StackId,
        /// Requested output key
        key: String,
    },

    /// Status change not allowed by the stack state machine
    #[error("stack '{stack}' cannot move from {from} to {to}")]
    IllegalTransition {
        /// Stack being transitioned
        stack: StackId,
        /// Current status
        from: StackStatus,
        /// Requested status
        to: StackStatus,
    },

    /// Removal refused because other stacks still depend on this one
    #[error("stack '{stack}' still has dependents: {dependents:?}")]
    HasDependents {
        /// Stack being removed
        stack: StackId,
        /// Declared stacks depending on it
        dependents: Vec<StackId>,
    },
}

impl GraphError {
    /// Errors caused by a malformed plan rather than by provisioning
    #[inline]
    #[must_use]
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, Self::CycleDetected(_) | Self::DuplicateNode(_))
    }
}
