//! Traffic controller
//!
//! Owns the live split and walks it through the phase plan. Transitions are
//! serialized by one async mutex held across the routing push, so an advance
//! and a rollback can never interleave. Readers get the last published view
//! without waiting on an in-flight push.
//!
//! ```text
//! Shifting(0) ──advance──▶ Shifting(1) ──advance──▶ … ──advance──▶ Completed
//!      │                        │
//!      └──────force_rollback────┴──────────────────────────────▶ RolledBack
//! ```

use crate::error::{GateFailure, TrafficError};
use crate::phase::{MigrationPhase, PhasePlan};
use crate::retry::RetryPolicy;
use crate::run::{MigrationRun, RollbackReason, RollbackRecord, RunOutcome};
use crate::weight::TrafficWeight;
use cutover_signals::{AdapterError, Clock, Environment, HealthProbe, ReplicationMonitor};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Load balancer / weighted DNS collaborator
#[async_trait::async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Apply a split; `Ok` means the router acknowledged it
    async fn set_weights(&self, weight: TrafficWeight) -> Result<(), AdapterError>;
}

/// Controller tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Health window the advance gate judges error rates over
    #[serde(with = "crate::millis")]
    pub evaluation_window: Duration,
    /// Routing push retries; the rollback guard cannot run while an
    /// advance push is retrying, so keep `worst_case` under the shortest
    /// guard window
    pub push_retry: RetryPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            evaluation_window: Duration::from_secs(60),
            push_retry: RetryPolicy::default()
                .with_max_attempts(3)
                .with_attempt_timeout(Duration::from_secs(5)),
        }
    }
}

/// Signal sources the advance gate reads
#[derive(Debug, Clone)]
pub struct Gates {
    /// Replication lag
    pub replication: Arc<ReplicationMonitor>,
    /// Environment health
    pub health: Arc<HealthProbe>,
}

/// Controller state machine
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerState {
    /// Holding a phase's split
    Shifting {
        /// Current phase
        phase_index: usize,
        /// When the phase was entered
        entered_at: Instant,
    },
    /// Final phase reached
    Completed,
    /// Returned to the old environment
    RolledBack {
        /// Trigger
        reason: RollbackReason,
        /// Phase held when the rollback fired
        phase_index: usize,
    },
}

impl ControllerState {
    /// Whether no further transitions are accepted
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Shifting { .. })
    }
}

#[derive(Debug, Clone)]
struct View {
    state: ControllerState,
    run: MigrationRun,
    routing_in_sync: bool,
}

/// Phased traffic shifter
pub struct TrafficController {
    phases: PhasePlan,
    router: Arc<dyn TrafficRouter>,
    gates: Gates,
    settings: ControllerSettings,
    clock: Clock,
    transition: Mutex<View>,
    published: RwLock<View>,
}

impl std::fmt::Debug for TrafficController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.published.read();
        f.debug_struct("TrafficController")
            .field("state", &view.state)
            .field("weight", &view.run.weight)
            .field("routing_in_sync", &view.routing_in_sync)
            .finish_non_exhaustive()
    }
}

impl TrafficController {
    /// Controller for a fresh run on `plan_name`, positioned on phase 0
    #[must_use]
    pub fn new(
        plan_name: impl Into<String>,
        phases: PhasePlan,
        router: Arc<dyn TrafficRouter>,
        gates: Gates,
        settings: ControllerSettings,
    ) -> Self {
        let clock = Clock::new();
        let run = MigrationRun::new(plan_name, &phases, clock.now());
        let view = View {
            state: ControllerState::Shifting {
                phase_index: 0,
                entered_at: Instant::now(),
            },
            run,
            routing_in_sync: false,
        };
        Self::from_view(phases, router, gates, settings, clock, view)
    }

    /// Rebuild a controller from a persisted run
    ///
    /// Terminal runs come back terminal. A run mid-shift restarts the dwell of
    /// its phase. Routing is assumed out of sync until the next push.
    ///
    /// # Errors
    /// - `InvalidPlan` if the run's phase does not exist in `phases`
    /// - `AlreadyTerminal(Aborted)` for runs that never reached shifting
    pub fn resume(
        run: MigrationRun,
        phases: PhasePlan,
        router: Arc<dyn TrafficRouter>,
        gates: Gates,
        settings: ControllerSettings,
    ) -> Result<Self, TrafficError> {
        let Some(phase) = phases.get(run.phase_index) else {
            return Err(TrafficError::InvalidPlan(format!(
                "persisted phase {} not in a {}-phase plan",
                run.phase_index,
                phases.len()
            )));
        };
        let state = match (run.outcome, &run.rollback) {
            (None, _) => {
                if run.weight != phase.weight {
                    return Err(TrafficError::InvalidPlan(format!(
                        "persisted weight {} does not match phase {} ({})",
                        run.weight, phase.name, phase.weight
                    )));
                }
                ControllerState::Shifting {
                    phase_index: run.phase_index,
                    entered_at: Instant::now(),
                }
            }
            (Some(RunOutcome::Completed), _) => ControllerState::Completed,
            (Some(RunOutcome::RolledBack), Some(record)) => ControllerState::RolledBack {
                reason: record.reason.clone(),
                phase_index: record.phase_index,
            },
            (Some(RunOutcome::RolledBack), None) => {
                return Err(TrafficError::InvalidPlan(
                    "rolled back run without a rollback record".into(),
                ))
            }
            (Some(RunOutcome::Aborted), _) => {
                return Err(TrafficError::AlreadyTerminal(RunOutcome::Aborted))
            }
        };
        tracing::info!(
            run_id = %run.run_id,
            phase = run.phase_index,
            weight = %run.weight,
            sequence = run.sequence,
            "traffic controller resumed"
        );
        let view = View {
            state,
            run,
            routing_in_sync: false,
        };
        Ok(Self::from_view(phases, router, gates, settings, Clock::new(), view))
    }

    fn from_view(
        phases: PhasePlan,
        router: Arc<dyn TrafficRouter>,
        gates: Gates,
        settings: ControllerSettings,
        clock: Clock,
        view: View,
    ) -> Self {
        Self {
            phases,
            router,
            gates,
            settings,
            clock,
            published: RwLock::new(view.clone()),
            transition: Mutex::new(view),
        }
    }

    /// Move to the next phase if its gate is satisfied
    ///
    /// Returns the new weight.
    ///
    /// # Errors
    /// - `AlreadyTerminal` once completed or rolled back
    /// - `PhaseGateNotSatisfied` when dwell, replication, health or the
    ///   routing push says "not yet"; state is untouched
    pub async fn advance_phase(&self) -> Result<TrafficWeight, TrafficError> {
        let mut view = self.transition.lock().await;
        let (index, entered_at) = match &view.state {
            ControllerState::Shifting {
                phase_index,
                entered_at,
            } => (*phase_index, *entered_at),
            ControllerState::Completed => {
                return Err(TrafficError::AlreadyTerminal(RunOutcome::Completed))
            }
            ControllerState::RolledBack { .. } => {
                return Err(TrafficError::AlreadyTerminal(RunOutcome::RolledBack))
            }
        };
        let (Some(current), Some(next)) = (self.phases.get(index), self.phases.get(index + 1))
        else {
            return Err(TrafficError::AlreadyTerminal(RunOutcome::Completed));
        };

        if let Err(gate) = self.check_gate(current, next, entered_at) {
            tracing::debug!(phase = index, next = %next.name, reason = %gate, "phase gate not satisfied");
            return Err(TrafficError::PhaseGateNotSatisfied(gate));
        }

        if let Err(err) = self.push(next.weight).await {
            tracing::warn!(phase = index, weight = %next.weight, error = %err, "advance push failed");
            return Err(TrafficError::PhaseGateNotSatisfied(
                GateFailure::RoutingPushFailed(err),
            ));
        }

        let next_index = index + 1;
        let now = self.clock.now();
        view.run.phase_index = next_index;
        view.run.phase_name.clone_from(&next.name);
        view.run.weight = next.weight;
        view.routing_in_sync = true;
        if next_index == self.phases.last_index() {
            view.state = ControllerState::Completed;
            view.run.outcome = Some(RunOutcome::Completed);
        } else {
            view.state = ControllerState::Shifting {
                phase_index: next_index,
                entered_at: Instant::now(),
            };
        }
        view.run.touch(now);
        self.publish(&view);

        tracing::info!(
            run_id = %view.run.run_id,
            phase = next_index,
            name = %next.name,
            weight = %next.weight,
            sequence = view.run.sequence,
            completed = view.state == ControllerState::Completed,
            "advanced traffic phase"
        );
        Ok(next.weight)
    }

    fn check_gate(
        &self,
        current: &MigrationPhase,
        next: &MigrationPhase,
        entered_at: Instant,
    ) -> Result<(), GateFailure> {
        let held = entered_at.elapsed();
        if held < current.min_dwell {
            return Err(GateFailure::DwellNotElapsed {
                remaining: current.min_dwell - held,
            });
        }

        if !self.gates.replication.is_caught_up(next.max_lag) {
            return Err(GateFailure::ReplicationLagging {
                ceiling: next.max_lag,
                lag: self.gates.replication.current_lag().ok(),
            });
        }

        for env in Environment::ALL {
            let failures = self.gates.health.consecutive_failures(env);
            if failures > 0 {
                return Err(GateFailure::HealthUnobservable { env, failures });
            }
            let rate = self
                .gates
                .health
                .error_rate(env, self.settings.evaluation_window)
                .map_err(GateFailure::InsufficientHealthData)?;
            if rate >= next.max_error_rate {
                return Err(GateFailure::ErrorRateTooHigh {
                    env,
                    rate,
                    ceiling: next.max_error_rate,
                });
            }
        }
        Ok(())
    }

    /// Return all traffic to the old environment and become terminal
    ///
    /// Calling again after a rollback returns the first record unchanged. If
    /// the router never acknowledges `100/0` the controller is terminal anyway
    /// and reports `routing_in_sync() == false` until [`Self::resync_routing`]
    /// succeeds.
    ///
    /// # Errors
    /// `AlreadyTerminal(Completed)` after the migration completed
    pub async fn force_rollback(
        &self,
        reason: RollbackReason,
    ) -> Result<RollbackRecord, TrafficError> {
        let mut view = self.transition.lock().await;
        let index = match &view.state {
            ControllerState::Shifting { phase_index, .. } => *phase_index,
            ControllerState::Completed => {
                return Err(TrafficError::AlreadyTerminal(RunOutcome::Completed))
            }
            ControllerState::RolledBack { .. } => {
                if let Some(existing) = &view.run.rollback {
                    tracing::debug!(reason = %reason, "rollback already recorded; ignoring");
                    return Ok(existing.clone());
                }
                return Err(TrafficError::AlreadyTerminal(RunOutcome::RolledBack));
            }
        };

        tracing::error!(
            run_id = %view.run.run_id,
            phase = index,
            from = %view.run.weight,
            reason = %reason,
            "rolling back traffic"
        );
        let pushed = self.push(TrafficWeight::ALL_OLD).await;
        if let Err(err) = &pushed {
            tracing::error!(error = %err, "rollback push not acknowledged; routing out of sync");
        }

        let now = self.clock.now();
        let record = RollbackRecord {
            reason: reason.clone(),
            phase_index: index,
            phase_name: view.run.phase_name.clone(),
            at: now,
        };
        view.state = ControllerState::RolledBack {
            reason,
            phase_index: index,
        };
        view.run.weight = TrafficWeight::ALL_OLD;
        view.run.outcome = Some(RunOutcome::RolledBack);
        view.run.rollback = Some(record.clone());
        view.routing_in_sync = pushed.is_ok();
        view.run.touch(now);
        self.publish(&view);
        Ok(record)
    }

    /// Push the intended weight again
    ///
    /// Used after a rollback whose push failed, and to align routing with
    /// phase 0 before shifting starts.
    ///
    /// # Errors
    /// `Routing` if the router still does not acknowledge
    pub async fn resync_routing(&self) -> Result<TrafficWeight, TrafficError> {
        let mut view = self.transition.lock().await;
        let weight = view.run.weight;
        match self.push(weight).await {
            Ok(()) => {
                view.routing_in_sync = true;
                self.publish(&view);
                tracing::info!(weight = %weight, "routing in sync");
                Ok(weight)
            }
            Err(err) => {
                view.routing_in_sync = false;
                self.publish(&view);
                Err(TrafficError::Routing(err))
            }
        }
    }

    async fn push(&self, weight: TrafficWeight) -> Result<(), AdapterError> {
        let router = Arc::clone(&self.router);
        self.settings
            .push_retry
            .run("set_weights", |_| {
                let router = Arc::clone(&router);
                async move { router.set_weights(weight).await }
            })
            .await
    }

    fn publish(&self, view: &View) {
        *self.published.write() = view.clone();
    }

    /// Intended split
    #[must_use]
    pub fn current_weight(&self) -> TrafficWeight {
        self.published.read().run.weight
    }

    /// Snapshot of the run record
    #[must_use]
    pub fn run(&self) -> MigrationRun {
        self.published.read().run.clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.published.read().state.clone()
    }

    /// Current phase definition
    #[must_use]
    pub fn phase(&self) -> Option<MigrationPhase> {
        let index = self.published.read().run.phase_index;
        self.phases.get(index).cloned()
    }

    /// Whether the controller accepts no further transitions
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.published.read().state.is_terminal()
    }

    /// Whether the router acknowledged the intended split
    #[must_use]
    pub fn routing_in_sync(&self) -> bool {
        self.published.read().routing_in_sync
    }

    /// Phase plan
    #[must_use]
    pub fn phases(&self) -> &PhasePlan {
        &self.phases
    }
}
