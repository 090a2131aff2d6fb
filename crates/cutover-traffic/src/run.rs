//! Persisted record of one migration attempt

use crate::phase::PhasePlan;
use crate::weight::TrafficWeight;
use chrono::{DateTime, Utc};
use cutover_graph::StackId;
use cutover_signals::Environment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Terminal outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Traffic fully on the new environment
    Completed,
    /// Traffic returned to the old environment
    RolledBack,
    /// Stopped before traffic shifting began
    Aborted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::RolledBack => "rolled back",
            Self::Aborted => "aborted",
        })
    }
}

/// What triggered a rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RollbackReason {
    /// Replication task failed or became unobservable
    ReplicationFailed,
    /// New environment error rate above the hard ceiling
    HealthBreach {
        /// Environment observed
        env: Environment,
        /// Observed error rate
        rate: f64,
        /// Hard ceiling
        ceiling: f64,
        /// Evaluation window
        #[serde(with = "crate::millis")]
        window: Duration,
    },
    /// New environment health could not be read for too long
    HealthUnobservable {
        /// Consecutive failed health polls
        failures: u32,
    },
    /// Operator or caller requested an abort
    ExternalAbort {
        /// Reason given with the abort
        reason: String,
    },
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReplicationFailed => f.write_str("replication failure"),
            Self::HealthBreach {
                env,
                rate,
                ceiling,
                window,
            } => write!(
                f,
                "health breach: {env} error rate {:.2}% over {window:?} exceeds hard ceiling {:.2}%",
                rate * 100.0,
                ceiling * 100.0
            ),
            Self::HealthUnobservable { failures } => write!(
                f,
                "health breach: new environment unobservable after {failures} failed polls"
            ),
            Self::ExternalAbort { reason } => write!(f, "explicit abort: {reason}"),
        }
    }
}

/// When and why the run rolled back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRecord {
    /// Trigger
    pub reason: RollbackReason,
    /// Phase index held when the rollback fired
    pub phase_index: usize,
    /// Phase name held when the rollback fired
    pub phase_name: String,
    /// Rollback time
    pub at: DateTime<Utc>,
}

/// Stack whose provisioning aborted the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFailure {
    /// Failed stack
    pub stack: StackId,
    /// Provisioner's last error
    pub reason: String,
}

/// Flat, serializable record of a migration attempt
///
/// `sequence` increases by one on every change; stores refuse to persist a
/// lower sequence than they hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Unique run id
    pub run_id: Ulid,
    /// Plan this run executes
    pub plan_name: String,
    /// Change counter
    pub sequence: u64,
    /// Current phase index
    pub phase_index: usize,
    /// Current phase name
    pub phase_name: String,
    /// Intended traffic split
    pub weight: TrafficWeight,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Last change
    pub last_transition_at: DateTime<Utc>,
    /// Terminal outcome, if reached
    pub outcome: Option<RunOutcome>,
    /// Rollback details for `RolledBack` runs
    pub rollback: Option<RollbackRecord>,
    /// Failed stack for `Aborted` runs that stopped in provisioning
    pub failed_stack: Option<StackFailure>,
    /// Outputs of stacks already provisioned
    #[serde(default)]
    pub ready_stacks: BTreeMap<StackId, BTreeMap<String, String>>,
}

impl MigrationRun {
    /// Fresh run positioned on the first phase
    #[must_use]
    pub fn new(plan_name: impl Into<String>, phases: &PhasePlan, now: DateTime<Utc>) -> Self {
        let (phase_name, weight) = phases
            .get(0)
            .map_or((String::new(), TrafficWeight::ALL_OLD), |p| {
                (p.name.clone(), p.weight)
            });
        Self {
            run_id: Ulid::new(),
            plan_name: plan_name.into(),
            sequence: 0,
            phase_index: 0,
            phase_name,
            weight,
            started_at: now,
            last_transition_at: now,
            outcome: None,
            rollback: None,
            failed_stack: None,
            ready_stacks: BTreeMap::new(),
        }
    }

    /// Record a change: bump the sequence and transition time
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.sequence += 1;
        self.last_transition_at = now;
    }

    /// Whether the run reached an outcome
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    /// One-line summary for logs and the CLI
    #[must_use]
    pub fn summary(&self) -> String {
        match (&self.outcome, &self.rollback, &self.failed_stack) {
            (Some(RunOutcome::RolledBack), Some(rb), _) => format!(
                "rolled back at phase {} ({}): {}",
                rb.phase_index, rb.phase_name, rb.reason
            ),
            (Some(RunOutcome::Aborted), _, Some(failure)) => {
                format!("aborted: stack {} failed: {}", failure.stack, failure.reason)
            }
            (Some(outcome), _, _) => format!("{outcome} at {} ({})", self.phase_name, self.weight),
            (None, _, _) => format!("in progress at {} ({})", self.phase_name, self.weight),
        }
    }
}
