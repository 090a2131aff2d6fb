//! Traffic layer errors

use crate::run::RunOutcome;
use cutover_signals::{AdapterError, Environment, HealthError};
use std::fmt;
use std::time::Duration;

/// Why a phase advance was refused
///
/// This is the expected "not yet" answer: the supervisory loop logs it and
/// waits for the next tick.
#[derive(Debug, Clone, PartialEq)]
pub enum GateFailure {
    /// The current phase has not been held for its minimum dwell
    DwellNotElapsed {
        /// Time left before the dwell is satisfied
        remaining: Duration,
    },
    /// Replication is not caught up against the next phase's lag ceiling
    ReplicationLagging {
        /// Lag ceiling of the next phase
        ceiling: Duration,
        /// Latest lag, if any poll succeeded
        lag: Option<Duration>,
    },
    /// Not enough health samples to judge an environment
    InsufficientHealthData(HealthError),
    /// The latest health polls of an environment failed
    HealthUnobservable {
        /// Unobservable environment
        env: Environment,
        /// Consecutive failed polls
        failures: u32,
    },
    /// An environment's error rate is at or above the next phase's ceiling
    ErrorRateTooHigh {
        /// Offending environment
        env: Environment,
        /// Observed error rate
        rate: f64,
        /// Ceiling of the next phase
        ceiling: f64,
    },
    /// The router never acknowledged the new weight
    RoutingPushFailed(AdapterError),
}

impl fmt::Display for GateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DwellNotElapsed { remaining } => {
                write!(f, "minimum dwell not elapsed ({remaining:?} remaining)")
            }
            Self::ReplicationLagging { ceiling, lag: Some(lag) } => {
                write!(f, "replication lag {lag:?} not consistently below {ceiling:?}")
            }
            Self::ReplicationLagging { ceiling, lag: None } => {
                write!(f, "replication lag unknown (ceiling {ceiling:?})")
            }
            Self::InsufficientHealthData(err) => write!(f, "{err}"),
            Self::HealthUnobservable { env, failures } => {
                write!(f, "{env} health unobservable ({failures} failed polls)")
            }
            Self::ErrorRateTooHigh { env, rate, ceiling } => write!(
                f,
                "{env} error rate {:.3}% not below {:.3}%",
                rate * 100.0,
                ceiling * 100.0
            ),
            Self::RoutingPushFailed(err) => write!(f, "routing push failed: {err}"),
        }
    }
}

/// Traffic controller errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrafficError {
    /// Advance refused; see [`GateFailure`]
    #[error("phase gate not satisfied: {0}")]
    PhaseGateNotSatisfied(GateFailure),

    /// The controller reached a terminal state
    #[error("migration already terminal ({0})")]
    AlreadyTerminal(RunOutcome),

    /// Weights must be percentages summing to 100
    #[error("invalid traffic weight {old}/{new}: must sum to 100")]
    InvalidWeight {
        /// Old environment share
        old: u8,
        /// New environment share
        new: u8,
    },

    /// The phase list cannot drive a migration
    #[error("invalid phase plan: {0}")]
    InvalidPlan(String),

    /// Routing could not be brought in line with the intended weight
    #[error("routing push failed: {0}")]
    Routing(AdapterError),
}

impl TrafficError {
    /// Whether this is the expected "not yet" answer from a gate
    #[inline]
    #[must_use]
    pub fn is_gate(&self) -> bool {
        matches!(self, Self::PhaseGateNotSatisfied(_))
    }
}
