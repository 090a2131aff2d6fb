//! Rollout phases
//!
//! A phase plan is an ordered list of weights, e.g. `100/0 → 90/10 → 50/50 →
//! 0/100`. Phase 0 is the starting split; entering the last phase completes
//! the migration. The gate for entering phase `i + 1` uses phase `i + 1`'s
//! ceilings and phase `i`'s dwell.

use crate::error::TrafficError;
use crate::weight::TrafficWeight;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One step of the rollout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPhase {
    /// Display name, e.g. `canary`
    pub name: String,
    /// Split held while in this phase
    pub weight: TrafficWeight,
    /// Minimum time to hold this phase before advancing out of it
    #[serde(with = "crate::millis", default)]
    pub min_dwell: Duration,
    /// Replication lag must stay below this to enter the phase
    #[serde(with = "crate::millis")]
    pub max_lag: Duration,
    /// Both environments' error rates must be below this to enter the phase
    pub max_error_rate: f64,
}

impl MigrationPhase {
    /// Build a phase with no dwell
    ///
    /// # Errors
    /// `InvalidWeight` when `new_share > 100`
    pub fn new(
        name: impl Into<String>,
        new_share: u8,
        max_lag: Duration,
        max_error_rate: f64,
    ) -> Result<Self, TrafficError> {
        Ok(Self {
            name: name.into(),
            weight: TrafficWeight::with_new_share(new_share)?,
            min_dwell: Duration::ZERO,
            max_lag,
            max_error_rate,
        })
    }

    /// Set the minimum dwell
    #[must_use]
    pub fn with_min_dwell(mut self, dwell: Duration) -> Self {
        self.min_dwell = dwell;
        self
    }
}

/// Validated, ordered phase list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<MigrationPhase>", into = "Vec<MigrationPhase>")]
pub struct PhasePlan {
    phases: Vec<MigrationPhase>,
}

impl PhasePlan {
    /// Validate a phase list
    ///
    /// # Errors
    /// `InvalidPlan` unless there are at least two phases, the new share
    /// strictly increases, the last phase is `0/100`, and every ceiling is a
    /// usable rate in `(0, 1]`
    pub fn new(phases: Vec<MigrationPhase>) -> Result<Self, TrafficError> {
        if phases.len() < 2 {
            return Err(TrafficError::InvalidPlan(format!(
                "need at least two phases, got {}",
                phases.len()
            )));
        }
        for pair in phases.windows(2) {
            if pair[1].weight.new_share() <= pair[0].weight.new_share() {
                return Err(TrafficError::InvalidPlan(format!(
                    "phase {} ({}) does not move traffic past {} ({})",
                    pair[1].name, pair[1].weight, pair[0].name, pair[0].weight
                )));
            }
        }
        if let Some(last) = phases.last() {
            if last.weight != TrafficWeight::ALL_NEW {
                return Err(TrafficError::InvalidPlan(format!(
                    "final phase {} must be 0/100, got {}",
                    last.name, last.weight
                )));
            }
        }
        if let Some(bad) = phases
            .iter()
            .find(|p| !(p.max_error_rate > 0.0 && p.max_error_rate <= 1.0))
        {
            return Err(TrafficError::InvalidPlan(format!(
                "phase {} error-rate ceiling {} outside (0, 1]",
                bad.name, bad.max_error_rate
            )));
        }
        Ok(Self { phases })
    }

    /// Phase at `index`
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&MigrationPhase> {
        self.phases.get(index)
    }

    /// Index of the terminal phase
    #[must_use]
    pub fn last_index(&self) -> usize {
        self.phases.len() - 1
    }

    /// Number of phases
    #[must_use]
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Always false; a valid plan has at least two phases
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Iterate phases in order
    pub fn iter(&self) -> impl Iterator<Item = &MigrationPhase> {
        self.phases.iter()
    }
}

impl TryFrom<Vec<MigrationPhase>> for PhasePlan {
    type Error = TrafficError;

    fn try_from(phases: Vec<MigrationPhase>) -> Result<Self, Self::Error> {
        Self::new(phases)
    }
}

impl From<PhasePlan> for Vec<MigrationPhase> {
    fn from(plan: PhasePlan) -> Self {
        plan.phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(name: &str, new: u8) -> MigrationPhase {
        MigrationPhase::new(name, new, Duration::from_secs(5), 0.01).unwrap()
    }

    #[test]
    fn standard_plan_is_accepted() {
        let plan = PhasePlan::new(vec![
            phase("baseline", 0),
            phase("canary", 10),
            phase("half", 50),
            phase("full", 100),
        ])
        .unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.last_index(), 3);
        assert_eq!(plan.get(1).map(|p| p.weight.to_string()), Some("90/10".into()));
    }

    #[test]
    fn plans_must_move_forward_and_finish_on_new() {
        assert!(PhasePlan::new(vec![phase("only", 100)]).is_err());
        assert!(PhasePlan::new(vec![phase("a", 0), phase("b", 50)]).is_err());
        assert!(PhasePlan::new(vec![phase("a", 50), phase("b", 10), phase("c", 100)]).is_err());
        assert!(PhasePlan::new(vec![phase("a", 0), phase("b", 0), phase("c", 100)]).is_err());
    }

    #[test]
    fn ceilings_must_be_rates() {
        let mut bad = phase("b", 100);
        bad.max_error_rate = 0.0;
        assert!(matches!(
            PhasePlan::new(vec![phase("a", 0), bad]),
            Err(TrafficError::InvalidPlan(_))
        ));
    }
}
