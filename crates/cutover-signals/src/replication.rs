//! Replication lag monitor
//!
//! Polls the continuous replication task that keeps the new environment's
//! database in sync with the old one. "Caught up" is debounced: the last N
//! consecutive polls must all report lag below the ceiling. Repeated poll
//! failures latch the task status to `Failed`, which the rollback guard treats
//! as an unconditional trigger.

use crate::clock::Clock;
use crate::error::{AdapterError, ReplicationError};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Status of the replication task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationStatus {
    /// Task created, not yet copying
    Starting,
    /// Initial bulk copy running
    FullLoadInProgress,
    /// Initial copy done; streaming changes
    CdcInProgress,
    /// Task stopped
    Stopped,
    /// Task failed or its health can no longer be observed
    Failed,
}

impl fmt::Display for ReplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::FullLoadInProgress => "full_load_in_progress",
            Self::CdcInProgress => "cdc_in_progress",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One answer from the replication status adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Replication lag
    pub lag: Duration,
    /// Task status
    pub status: ReplicationStatus,
    /// Cumulative error count reported by the task
    pub error_count: u64,
}

impl ReplicationReport {
    /// A healthy CDC report with the given lag
    #[must_use]
    pub fn streaming(lag: Duration) -> Self {
        Self {
            lag,
            status: ReplicationStatus::CdcInProgress,
            error_count: 0,
        }
    }
}

/// Replication status collaborator
#[async_trait::async_trait]
pub trait ReplicationStatusSource: Send + Sync {
    /// Current status of replication task `task_id`
    async fn replication_status(&self, task_id: &str) -> Result<ReplicationReport, AdapterError>;
}

/// Monitor tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSettings {
    /// Consecutive polls that must be under the ceiling to count as caught up
    pub debounce_polls: usize,
    /// Consecutive poll failures after which the task is considered `Failed`
    pub failure_threshold: u32,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            debounce_polls: 3,
            failure_threshold: 5,
        }
    }
}

/// Point-in-time view of the replication task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Source database id
    pub source_id: String,
    /// Target database id
    pub target_id: String,
    /// Most recent lag; `None` before the first successful poll
    pub lag: Option<Duration>,
    /// Cumulative task error count
    pub error_count: u64,
    /// Task status
    pub status: ReplicationStatus,
    /// Poll failures since the last success
    pub consecutive_failures: u32,
    /// Time of the last poll attempt
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl ReplicationState {
    fn new(source_id: String, target_id: String) -> Self {
        Self {
            source_id,
            target_id,
            lag: None,
            error_count: 0,
            status: ReplicationStatus::Starting,
            consecutive_failures: 0,
            last_polled_at: None,
        }
    }

    /// Id handed to the status adapter
    #[must_use]
    pub fn task_id(&self) -> String {
        format!("{}->{}", self.source_id, self.target_id)
    }
}

#[derive(Debug)]
struct Inner {
    state: ReplicationState,
    recent_lags: VecDeque<Duration>,
}

/// Tracks whether the new database has caught up with the old one
pub struct ReplicationMonitor {
    source: Arc<dyn ReplicationStatusSource>,
    settings: ReplicationSettings,
    clock: Clock,
    inner: RwLock<Inner>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ReplicationMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationMonitor")
            .field("settings", &self.settings)
            .field("state", &self.inner.read().state)
            .finish_non_exhaustive()
    }
}

impl ReplicationMonitor {
    /// Create a stopped monitor
    #[must_use]
    pub fn new(source: Arc<dyn ReplicationStatusSource>, settings: ReplicationSettings) -> Self {
        Self {
            source,
            settings,
            clock: Clock::new(),
            inner: RwLock::new(Inner {
                state: ReplicationState::new(String::new(), String::new()),
                recent_lags: VecDeque::with_capacity(settings.debounce_polls.max(1)),
            }),
            poller: Mutex::new(None),
        }
    }

    /// Begin polling replication from `source_id` to `target_id`
    ///
    /// # Errors
    /// `AlreadyRunning` if a poller is active
    pub fn start(
        self: &Arc<Self>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<(), ReplicationError> {
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(ReplicationError::AlreadyRunning);
        }

        {
            let mut inner = self.inner.write();
            inner.state = ReplicationState::new(source_id.into(), target_id.into());
            inner.recent_lags.clear();
            tracing::info!(
                task = %inner.state.task_id(),
                interval_ms = poll_interval.as_millis() as u64,
                "replication monitor started"
            );
        }

        let monitor: Weak<Self> = Arc::downgrade(self);
        *poller = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                // Failures are folded into the state; nothing to do here
                let _ = monitor.poll_once().await;
            }
        }));
        Ok(())
    }

    /// Stop the background poller; state is kept
    pub fn stop(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
            tracing::info!("replication monitor stopped");
        }
    }

    /// Whether a poller is active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.poller.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Poll the adapter once and fold the answer into the state
    ///
    /// # Errors
    /// `Adapter` when the status call fails
    pub async fn poll_once(&self) -> Result<ReplicationReport, ReplicationError> {
        let task_id = self.inner.read().state.task_id();
        let result = self.source.replication_status(&task_id).await;
        let now = self.clock.now();

        let mut inner = self.inner.write();
        inner.state.last_polled_at = Some(now);
        match result {
            Ok(report) => {
                inner.state.consecutive_failures = 0;
                inner.state.lag = Some(report.lag);
                inner.state.error_count = report.error_count;
                if inner.state.status != ReplicationStatus::Failed {
                    if report.status == ReplicationStatus::Failed {
                        tracing::error!(task = %task_id, "replication task reported failure");
                    }
                    inner.state.status = report.status;
                }
                if report.status == ReplicationStatus::CdcInProgress {
                    let depth = self.settings.debounce_polls.max(1);
                    if inner.recent_lags.len() == depth {
                        inner.recent_lags.pop_front();
                    }
                    inner.recent_lags.push_back(report.lag);
                } else {
                    // Only streaming polls count towards the debounce run
                    inner.recent_lags.clear();
                }
                tracing::debug!(
                    task = %task_id,
                    lag_ms = report.lag.as_millis() as u64,
                    status = %report.status,
                    "replication polled"
                );
                Ok(report)
            }
            Err(err) => {
                inner.state.consecutive_failures += 1;
                inner.recent_lags.clear();
                let failures = inner.state.consecutive_failures;
                if failures >= self.settings.failure_threshold
                    && inner.state.status != ReplicationStatus::Failed
                {
                    inner.state.status = ReplicationStatus::Failed;
                    tracing::error!(
                        task = %task_id,
                        failures,
                        error = %err,
                        "replication status unobservable; marking task failed"
                    );
                } else {
                    tracing::warn!(task = %task_id, failures, error = %err, "replication poll failed");
                }
                Err(ReplicationError::Adapter(err))
            }
        }
    }

    /// Most recent lag measurement
    ///
    /// # Errors
    /// `LagUnknown` before the first successful poll
    pub fn current_lag(&self) -> Result<Duration, ReplicationError> {
        self.inner
            .read()
            .state
            .lag
            .ok_or(ReplicationError::LagUnknown)
    }

    /// Whether the last `debounce_polls` consecutive polls all reported lag
    /// strictly below `ceiling` while streaming changes
    #[must_use]
    pub fn is_caught_up(&self, ceiling: Duration) -> bool {
        let inner = self.inner.read();
        let depth = self.settings.debounce_polls.max(1);
        inner.state.status == ReplicationStatus::CdcInProgress
            && inner.recent_lags.len() >= depth
            && inner.recent_lags.iter().all(|lag| *lag < ceiling)
    }

    /// Current task status
    #[must_use]
    pub fn status(&self) -> ReplicationStatus {
        self.inner.read().state.status
    }

    /// Snapshot of the monitor state
    #[must_use]
    pub fn state(&self) -> ReplicationState {
        self.inner.read().state.clone()
    }

    /// Monitor tuning
    #[must_use]
    pub fn settings(&self) -> ReplicationSettings {
        self.settings
    }
}

impl Drop for ReplicationMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.poller.get_mut().take() {
            handle.abort();
        }
    }
}
