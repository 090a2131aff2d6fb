//! Rollback guard
//!
//! Supervisory check run once per tick, independent of the advance path.
//! Trips on any of: replication `Failed`; new-environment error rate above
//! the hard ceiling in any configured window; new-environment health
//! unreadable for too many polls in a row; an external abort. Fires at most
//! once per run.

use crate::abort::AbortSignal;
use crate::controller::TrafficController;
use crate::run::{RollbackReason, RollbackRecord};
use cutover_signals::{Environment, HealthProbe, ReplicationMonitor, ReplicationStatus};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Guard thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    /// New-environment error rate that forces a rollback; sits above every
    /// phase's advance ceiling
    pub hard_error_rate: f64,
    /// Windows the hard ceiling is checked over
    #[serde(with = "crate::millis::list")]
    pub windows: Vec<Duration>,
    /// Consecutive failed new-environment health polls that force a rollback
    pub max_poll_failures: u32,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            hard_error_rate: 0.05,
            windows: vec![Duration::from_secs(30), Duration::from_secs(120)],
            max_poll_failures: 5,
        }
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    /// No trigger fired
    Healthy,
    /// This evaluation rolled the controller back
    RolledBack(RollbackRecord),
    /// Controller already terminal or the guard already fired
    Inactive,
}

/// Forces the controller back to `100/0` on a safety violation
#[derive(Debug)]
pub struct RollbackGuard {
    controller: Arc<TrafficController>,
    replication: Arc<ReplicationMonitor>,
    health: Arc<HealthProbe>,
    abort: AbortSignal,
    settings: GuardSettings,
    fired: AtomicBool,
}

impl RollbackGuard {
    /// Create an armed guard
    #[must_use]
    pub fn new(
        controller: Arc<TrafficController>,
        replication: Arc<ReplicationMonitor>,
        health: Arc<HealthProbe>,
        abort: AbortSignal,
        settings: GuardSettings,
    ) -> Self {
        Self {
            controller,
            replication,
            health,
            abort,
            settings,
            fired: AtomicBool::new(false),
        }
    }

    /// First trigger that currently holds, if any
    #[must_use]
    pub fn trigger(&self) -> Option<RollbackReason> {
        if self.replication.status() == ReplicationStatus::Failed {
            return Some(RollbackReason::ReplicationFailed);
        }

        for window in &self.settings.windows {
            // Too few samples is not a breach; the advance gate already
            // refuses to move on thin data.
            if let Ok(rate) = self.health.error_rate(Environment::New, *window) {
                if rate > self.settings.hard_error_rate {
                    return Some(RollbackReason::HealthBreach {
                        env: Environment::New,
                        rate,
                        ceiling: self.settings.hard_error_rate,
                        window: *window,
                    });
                }
            }
        }

        let failures = self.health.consecutive_failures(Environment::New);
        if self.settings.max_poll_failures > 0 && failures >= self.settings.max_poll_failures {
            return Some(RollbackReason::HealthUnobservable { failures });
        }

        self.abort
            .reason()
            .map(|reason| RollbackReason::ExternalAbort { reason })
    }

    /// Check every trigger and roll back if one holds
    pub async fn evaluate(&self) -> GuardVerdict {
        if self.fired.load(Ordering::Acquire) || self.controller.is_terminal() {
            return GuardVerdict::Inactive;
        }
        let Some(reason) = self.trigger() else {
            return GuardVerdict::Healthy;
        };
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return GuardVerdict::Inactive;
        }

        tracing::error!(reason = %reason, "rollback guard tripped");
        match self.controller.force_rollback(reason).await {
            Ok(record) => GuardVerdict::RolledBack(record),
            Err(err) => {
                tracing::info!(error = %err, "guard tripped after the run finished; nothing to undo");
                GuardVerdict::Inactive
            }
        }
    }

    /// Whether the guard has fired
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Guard thresholds
    #[must_use]
    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }
}
