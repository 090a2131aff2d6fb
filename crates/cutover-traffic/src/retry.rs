//! Bounded exponential backoff for collaborator calls

use cutover_signals::AdapterError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry tuning for one kind of collaborator call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    #[serde(with = "crate::millis")]
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    #[serde(with = "crate::millis")]
    pub max_backoff: Duration,
    /// Growth factor between delays
    pub backoff_multiplier: f64,
    /// Budget for a single attempt
    #[serde(with = "crate::millis")]
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (0-based), capped at
    /// `max_backoff`
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        #[allow(clippy::cast_possible_wrap)]
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_backoff.as_secs_f64() * multiplier;
        let capped = delay.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Longest time `run` can take: every attempt timing out, plus the
    /// backoff between them
    #[must_use]
    pub fn worst_case(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        let backoff: Duration = (0..attempts - 1).map(|a| self.backoff_delay(a)).sum();
        self.attempt_timeout.saturating_mul(attempts) + backoff
    }

    /// Set the attempt count
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out
    ///
    /// Each attempt is bounded by `attempt_timeout`; an elapsed attempt counts
    /// as `AdapterError::Timeout`. `op` receives the 0-based attempt number.
    ///
    /// # Errors
    /// The last error seen
    pub async fn run<T, F, Fut>(&self, call: &str, mut op: F) -> Result<T, AdapterError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AdapterError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, op(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout(self.attempt_timeout)),
            };
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(call, attempts = attempt + 1, "call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(call, attempt, error = %err, "call rejected; not retrying");
                    return Err(err);
                }
                Err(err) if attempt + 1 >= attempts => {
                    tracing::warn!(call, attempts, error = %err, "retries exhausted");
                    return Err(err);
                }
                Err(err) => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        call,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "call failed; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn worst_case_adds_timeouts_and_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(150),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.worst_case(), Duration::from_millis(3250));
        assert_eq!(
            policy.with_max_attempts(0).worst_case(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run("router", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AdapterError::Unavailable("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("router", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::Unavailable("down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("router", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AdapterError::Rejected("bad weight".into())) }
            })
            .await;
        assert_eq!(result, Err(AdapterError::Rejected("bad weight".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempts_time_out() {
        let policy = RetryPolicy::default()
            .with_max_attempts(2)
            .with_attempt_timeout(Duration::from_secs(1));
        let result: Result<(), _> = policy
            .run("router", |_| std::future::pending::<Result<(), AdapterError>>())
            .await;
        assert_eq!(result, Err(AdapterError::Timeout(Duration::from_secs(1))));
    }
}
