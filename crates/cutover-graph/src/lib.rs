//! Cutover stack graph
//!
//! Dependency DAG over deployable units (network, security, database,
//! replication, compute, routing, monitoring). Computes a deterministic
//! creation order and tracks per-stack provisioning status so that a stack
//! only becomes `Ready` after everything it depends on is `Ready`.
//!
//! # Example
//!
//! ```rust
//! use cutover_graph::{StackGraph, StackId};
//! use std::collections::BTreeMap;
//!
//! let mut graph = StackGraph::new();
//! graph.add_node("network", &[]).unwrap();
//! graph.add_node("database", &["network"]).unwrap();
//!
//! let order = graph.topological_order().unwrap();
//! assert_eq!(order, vec![StackId::from("network"), StackId::from("database")]);
//!
//! graph.mark_in_progress("network").unwrap();
//! let mut outputs = BTreeMap::new();
//! outputs.insert("vpc_id".to_string(), "vpc-123".to_string());
//! graph.mark_ready("network", outputs).unwrap();
//!
//! assert_eq!(graph.resolve_output("network", "vpc_id").unwrap(), "vpc-123");
//! ```

pub mod error;
pub mod graph;
pub mod state_machine;
pub mod types;

pub use error::GraphError;
pub use graph::StackGraph;
pub use types::{StackId, StackNode, StackStatus};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
