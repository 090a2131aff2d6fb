//! Orchestrator settings
//!
//! Every duration is written in milliseconds. Missing keys fall back to
//! [`MigrationSettings::default`].

use crate::error::ConfigError;
use cutover_signals::{HealthSettings, ReplicationSettings};
use cutover_traffic::{millis, ControllerSettings, GuardSettings, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one migration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Supervisory loop period (guard, then advance)
    #[serde(with = "millis")]
    pub tick_interval: Duration,
    /// Replication status poll period
    #[serde(with = "millis")]
    pub replication_poll_interval: Duration,
    /// Replication debounce and failure threshold
    pub replication: ReplicationSettings,
    /// Health poll period
    #[serde(with = "millis")]
    pub health_poll_interval: Duration,
    /// Health window capacity and minimum samples
    pub health: HealthSettings,
    /// Advance gate window and routing push retries
    pub traffic: ControllerSettings,
    /// Rollback thresholds
    pub guard: GuardSettings,
    /// Provisioner call retries
    pub provision_retry: RetryPolicy,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            replication_poll_interval: Duration::from_secs(10),
            replication: ReplicationSettings::default(),
            health_poll_interval: Duration::from_secs(5),
            health: HealthSettings::default(),
            traffic: ControllerSettings::default(),
            guard: GuardSettings::default(),
            provision_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                backoff_multiplier: 2.0,
                attempt_timeout: Duration::from_secs(30 * 60),
            },
        }
    }
}

impl MigrationSettings {
    /// Default settings
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With supervisory tick
    #[inline]
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// With both poll intervals
    #[inline]
    #[must_use]
    pub fn with_poll_intervals(mut self, replication: Duration, health: Duration) -> Self {
        self.replication_poll_interval = replication;
        self.health_poll_interval = health;
        self
    }

    /// With rollback thresholds
    #[inline]
    #[must_use]
    pub fn with_guard(mut self, guard: GuardSettings) -> Self {
        self.guard = guard;
        self
    }

    /// With advance gate settings
    #[inline]
    #[must_use]
    pub fn with_traffic(mut self, traffic: ControllerSettings) -> Self {
        self.traffic = traffic;
        self
    }

    /// With provisioner retries
    #[inline]
    #[must_use]
    pub fn with_provision_retry(mut self, retry: RetryPolicy) -> Self {
        self.provision_retry = retry;
        self
    }

    /// Reject settings the control loop cannot run with
    ///
    /// # Errors
    /// `InvalidSetting` naming the first bad field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("tick_interval", self.tick_interval),
            ("replication_poll_interval", self.replication_poll_interval),
            ("health_poll_interval", self.health_poll_interval),
            ("traffic.evaluation_window", self.traffic.evaluation_window),
        ];
        for (field, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        if self.replication.debounce_polls == 0 {
            return Err(ConfigError::invalid(
                "replication.debounce_polls",
                "need at least one poll",
            ));
        }
        if self.replication.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "replication.failure_threshold",
                "must be positive",
            ));
        }
        if self.health.min_samples == 0 || self.health.min_samples > self.health.window_capacity {
            return Err(ConfigError::invalid(
                "health.min_samples",
                format!(
                    "must be between 1 and window_capacity ({})",
                    self.health.window_capacity
                ),
            ));
        }
        if !(self.guard.hard_error_rate > 0.0 && self.guard.hard_error_rate <= 1.0) {
            return Err(ConfigError::invalid(
                "guard.hard_error_rate",
                format!("{} outside (0, 1]", self.guard.hard_error_rate),
            ));
        }
        if self.guard.windows.is_empty() || self.guard.windows.iter().any(Duration::is_zero) {
            return Err(ConfigError::invalid(
                "guard.windows",
                "need at least one positive window",
            ));
        }
        for (field, retry) in [
            ("traffic.push_retry", &self.traffic.push_retry),
            ("provision_retry", &self.provision_retry),
        ] {
            if retry.max_attempts == 0 || retry.attempt_timeout.is_zero() {
                return Err(ConfigError::invalid(
                    field,
                    "need at least one attempt and a positive timeout",
                ));
            }
            if retry.backoff_multiplier < 1.0 {
                return Err(ConfigError::invalid(field, "backoff must not shrink"));
            }
        }
        Ok(())
    }

    /// Worst-case advance push when it outlasts the shortest guard window
    ///
    /// The guard and the advance share one tick, so a retrying push keeps
    /// the guard from evaluating for up to this long.
    #[must_use]
    pub fn guard_blind_spot(&self) -> Option<Duration> {
        let push = self.traffic.push_retry.worst_case();
        let shortest = self.guard.windows.iter().min()?;
        (push > *shortest).then_some(push)
    }
}
