//! Wall-clock timestamps driven by the tokio clock
//!
//! Timestamps are `anchor + elapsed(tokio Instant)`, so they advance with
//! `tokio::time::pause`/`advance` in tests exactly as timers do.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Monotonic source of UTC timestamps
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    started: Instant,
    wall: DateTime<Utc>,
}

impl Clock {
    /// Anchor a clock at the current instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            wall: Utc::now(),
        }
    }

    /// Current timestamp
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap_or_default();
        self.wall + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
