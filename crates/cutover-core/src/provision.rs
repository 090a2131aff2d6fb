//! Provisioning collaborator

use cutover_graph::StackId;
use cutover_signals::AdapterError;
use std::collections::BTreeMap;

/// Turns a stack into real infrastructure
///
/// `params` holds every output of the stack's direct dependencies, keyed
/// `"<dependency>.<key>"`. The returned map becomes the stack's outputs.
/// A call that returns has finished: there is no partially created stack.
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    /// Create or update `stack`
    async fn provision(
        &self,
        stack: &StackId,
        params: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, AdapterError>;
}
