//! Stack status transitions
//!
//! `Pending → InProgress → Ready`, with `Failed` reachable from `InProgress`.
//! A failed stack is retried by re-submitting it to `InProgress`.

use crate::error::GraphError;
use crate::types::{StackId, StackStatus};

/// Statuses reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: StackStatus) -> &'static [StackStatus] {
    use StackStatus::{Failed, InProgress, Pending, Ready};
    match from {
        Pending => &[InProgress],
        InProgress => &[Ready, Failed],
        Failed => &[InProgress],
        Ready => &[],
    }
}

/// Validate a status change for `stack`
pub fn validate_transition(
    stack: &StackId,
    from: StackStatus,
    to: StackStatus,
) -> Result<(), GraphError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(GraphError::IllegalTransition {
            stack: stack.clone(),
            from,
            to,
        })
    }
}
