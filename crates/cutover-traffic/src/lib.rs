//! Cutover traffic control
//!
//! - [`TrafficController`]: owns the old/new split and walks it forward
//!   through a [`PhasePlan`], one gated step at a time
//! - [`RollbackGuard`]: supervisory check that returns all traffic to the old
//!   environment on a safety violation, at most once per run
//! - [`MigrationRun`]: the flat record persisted after every transition
//!
//! Weight changes reach the load balancer through [`TrafficRouter`]; a change
//! only counts once the router acknowledges it.

pub mod abort;
pub mod controller;
pub mod error;
pub mod guard;
pub mod millis;
pub mod phase;
pub mod retry;
pub mod run;
pub mod weight;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use controller::{ControllerSettings, ControllerState, Gates, TrafficController, TrafficRouter};
pub use error::{GateFailure, TrafficError};
pub use guard::{GuardSettings, GuardVerdict, RollbackGuard};
pub use phase::{MigrationPhase, PhasePlan};
pub use retry::RetryPolicy;
pub use run::{MigrationRun, RollbackReason, RollbackRecord, RunOutcome, StackFailure};
pub use weight::TrafficWeight;
