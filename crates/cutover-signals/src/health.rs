//! Per-environment health windows
//!
//! Each environment keeps a fixed-capacity ring of [`HealthSnapshot`]s.
//! Error rate and p99 latency are computed over the snapshots whose
//! timestamp lies within a duration of the newest one, and only while that
//! newest one was recorded no longer than the same duration ago. Fewer than
//! `min_samples` snapshots in that span is `InsufficientData`, never healthy.

use crate::clock::Clock;
use crate::error::{AdapterError, HealthError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Which side of the migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Currently live (blue)
    Old,
    /// Migration target (green)
    New,
}

impl Environment {
    /// Both environments, old first
    pub const ALL: [Environment; 2] = [Environment::Old, Environment::New];

    fn index(self) -> usize {
        match self {
            Self::Old => 0,
            Self::New => 1,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Old => "old",
            Self::New => "new",
        })
    }
}

/// Raw reading from the health adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReading {
    /// Requests served since the previous reading
    pub request_count: u64,
    /// Failed requests since the previous reading
    pub error_count: u64,
    /// p99 request latency over the reading interval
    pub p99_latency: Duration,
}

/// Health collaborator, sampled per environment on every poll
#[async_trait::async_trait]
pub trait HealthSource: Send + Sync {
    /// Current reading for `env`
    async fn health(&self, env: Environment) -> Result<HealthReading, AdapterError>;
}

/// Immutable health observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Observed environment
    pub env: Environment,
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// Requests in the interval
    pub request_count: u64,
    /// Errors in the interval
    pub error_count: u64,
    /// p99 latency in the interval
    pub p99_latency: Duration,
}

impl HealthSnapshot {
    /// Stamp an adapter reading
    #[must_use]
    pub fn from_reading(env: Environment, reading: HealthReading, timestamp: DateTime<Utc>) -> Self {
        Self {
            env,
            timestamp,
            request_count: reading.request_count,
            error_count: reading.error_count,
            p99_latency: reading.p99_latency,
        }
    }
}

/// Window tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Snapshots retained per environment
    pub window_capacity: usize,
    /// Snapshots required inside a window before it can be judged
    pub min_samples: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            window_capacity: 120,
            min_samples: 3,
        }
    }
}

#[derive(Debug, Default)]
struct EnvWindow {
    samples: VecDeque<HealthSnapshot>,
    consecutive_failures: u32,
    last_recorded: Option<Instant>,
}

/// Rolling health picture for both environments
#[derive(Debug)]
pub struct HealthProbe {
    settings: HealthSettings,
    clock: Clock,
    windows: [RwLock<EnvWindow>; 2],
}

impl HealthProbe {
    /// Create an empty probe
    #[must_use]
    pub fn new(settings: HealthSettings) -> Self {
        let capacity = settings.window_capacity.max(1);
        let window = || {
            RwLock::new(EnvWindow {
                samples: VecDeque::with_capacity(capacity),
                consecutive_failures: 0,
                last_recorded: None,
            })
        };
        Self {
            settings: HealthSettings {
                window_capacity: capacity,
                ..settings
            },
            clock: Clock::new(),
            windows: [window(), window()],
        }
    }

    /// Append a snapshot to its environment's window, evicting the oldest
    /// entry when full
    pub fn record_snapshot(&self, snapshot: HealthSnapshot) {
        let mut window = self.windows[snapshot.env.index()].write();
        if window.samples.len() == self.settings.window_capacity {
            window.samples.pop_front();
        }
        window.consecutive_failures = 0;
        window.last_recorded = Some(Instant::now());
        window.samples.push_back(snapshot);
    }

    /// Sample both environments once
    ///
    /// Returns the environments whose reading failed.
    pub async fn poll_once(&self, source: &dyn HealthSource) -> Vec<(Environment, AdapterError)> {
        let mut failed = Vec::new();
        for env in Environment::ALL {
            match source.health(env).await {
                Ok(reading) => {
                    let snapshot = HealthSnapshot::from_reading(env, reading, self.clock.now());
                    self.record_snapshot(snapshot);
                }
                Err(err) => {
                    let failures = {
                        let mut window = self.windows[env.index()].write();
                        window.consecutive_failures += 1;
                        window.consecutive_failures
                    };
                    tracing::warn!(%env, failures, error = %err, "health poll failed");
                    failed.push((env, err));
                }
            }
        }
        failed
    }

    /// Poll both environments every `interval` until the probe is dropped or
    /// the handle aborted
    pub fn spawn_poller(
        self: &Arc<Self>,
        source: Arc<dyn HealthSource>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let probe: Weak<Self> = Arc::downgrade(self);
        tracing::info!(interval_ms = interval.as_millis() as u64, "health poller started");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(probe) = probe.upgrade() else {
                    break;
                };
                probe.poll_once(source.as_ref()).await;
            }
        })
    }

    /// Cumulative errors / requests over the most recent `window`
    ///
    /// A window with no requests has an error rate of zero.
    ///
    /// # Errors
    /// `InsufficientData` if fewer than `min_samples` snapshots fall inside
    pub fn error_rate(&self, env: Environment, window: Duration) -> Result<f64, HealthError> {
        let guard = self.windows[env.index()].read();
        let samples = self.in_window(env, &guard, window)?;
        let requests: u64 = samples.iter().map(|s| s.request_count).sum();
        let errors: u64 = samples.iter().map(|s| s.error_count).sum();
        if requests == 0 {
            return Ok(0.0);
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = errors as f64 / requests as f64;
        Ok(rate)
    }

    /// 99th percentile latency over the most recent `window`, linearly
    /// interpolated between ordered samples
    ///
    /// # Errors
    /// `InsufficientData` if fewer than `min_samples` snapshots fall inside
    pub fn p99_latency(&self, env: Environment, window: Duration) -> Result<Duration, HealthError> {
        let guard = self.windows[env.index()].read();
        let samples = self.in_window(env, &guard, window)?;
        let mut values: Vec<f64> = samples
            .iter()
            .map(|s| s.p99_latency.as_secs_f64())
            .collect();
        values.sort_by(f64::total_cmp);
        let p99 = percentile(&values, 0.99).unwrap_or_default();
        Ok(Duration::from_secs_f64(p99.max(0.0)))
    }

    /// Health poll failures for `env` since its last recorded snapshot
    #[must_use]
    pub fn consecutive_failures(&self, env: Environment) -> u32 {
        self.windows[env.index()].read().consecutive_failures
    }

    /// Copy of the window for `env`, oldest first
    #[must_use]
    pub fn snapshots(&self, env: Environment) -> Vec<HealthSnapshot> {
        self.windows[env.index()].read().samples.iter().cloned().collect()
    }

    /// Newest snapshot for `env`
    #[must_use]
    pub fn latest(&self, env: Environment) -> Option<HealthSnapshot> {
        self.windows[env.index()].read().samples.back().cloned()
    }

    /// Window tuning
    #[must_use]
    pub fn settings(&self) -> HealthSettings {
        self.settings
    }

    fn in_window<'a>(
        &self,
        env: Environment,
        state: &'a EnvWindow,
        window: Duration,
    ) -> Result<Vec<&'a HealthSnapshot>, HealthError> {
        // A window whose newest sample arrived too long ago says nothing about now
        let fresh = state
            .last_recorded
            .is_some_and(|at| at.elapsed() <= window);
        let selected: Vec<&HealthSnapshot> = match state.samples.back() {
            Some(newest) if fresh => state
                .samples
                .iter()
                .filter(|s| {
                    newest
                        .timestamp
                        .signed_duration_since(s.timestamp)
                        .to_std()
                        .map_or(true, |age| age <= window)
                })
                .collect(),
            _ => Vec::new(),
        };
        if selected.len() < self.settings.min_samples {
            return Err(HealthError::InsufficientData {
                env,
                available: selected.len(),
                required: self.settings.min_samples,
            });
        }
        Ok(selected)
    }
}

/// Percentile `q` (0..=1) of ascending `sorted`, linearly interpolated
#[must_use]
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    match sorted {
        [] => None,
        [only] => Some(*only),
        _ => {
            #[allow(clippy::cast_precision_loss)]
            let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let lo = rank.floor() as usize;
            let hi = (lo + 1).min(sorted.len() - 1);
            #[allow(clippy::cast_precision_loss)]
            let frac = rank - lo as f64;
            Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
        }
    }
}
