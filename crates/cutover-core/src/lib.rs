//! Cutover orchestrator
//!
//! Runs a blue/green migration end to end:
//! - provisions the new environment's stacks in dependency order, feeding
//!   each stack the outputs of its dependencies
//! - starts database replication once the target databases exist
//! - shifts traffic old → new through the plan's phases, each step gated on
//!   replication lag and error rate
//! - rolls all traffic back to the old environment on a health breach, a
//!   replication failure or an explicit abort
//!
//! Progress is persisted through a [`RunStore`] after every transition, so a
//! restarted process resumes where the last one stopped.
//!
//! ```no_run
//! use cutover_core::{FileRunStore, MigrationOrchestrator, MigrationPlan, Simulation, SimulatorConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let plan = MigrationPlan::from_path("orders.toml")?;
//! let sim = Simulation::new(SimulatorConfig::default());
//! let orchestrator = MigrationOrchestrator::new(
//!     sim.collaborators(),
//!     Arc::new(FileRunStore::new(".cutover")),
//! );
//! let report = orchestrator.run(&plan).await?;
//! println!("{}", report.run.summary());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod provision;
pub mod sim;
pub mod store;

pub use config::MigrationSettings;
pub use error::{ConfigError, OrchestratorError, StoreError};
pub use orchestrator::{Collaborators, MigrationOrchestrator, MigrationReport};
pub use plan::{MigrationPlan, ReplicationSpec, StackRole, StackSpec};
pub use provision::Provisioner;
pub use sim::{demo_plan, Simulation, SimulatorConfig};
pub use store::{FileRunStore, MemoryRunStore, RunStore};
