#![allow(dead_code)]

use chrono::{DateTime, Utc};
use cutover_signals::{
    AdapterError, Environment, HealthProbe, HealthSettings, HealthSnapshot, ReplicationMonitor,
    ReplicationReport, ReplicationSettings, ReplicationStatus, ReplicationStatusSource,
};
use cutover_traffic::{
    ControllerSettings, Gates, MigrationPhase, PhasePlan, RetryPolicy, TrafficController,
    TrafficRouter, TrafficWeight,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct Router {
    pub pushes: Mutex<Vec<TrafficWeight>>,
    pub attempts: AtomicU32,
    pub failing: AtomicBool,
}

impl Router {
    pub fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> Vec<TrafficWeight> {
        self.pushes.lock().clone()
    }
}

#[async_trait::async_trait]
impl TrafficRouter for Router {
    async fn set_weights(&self, weight: TrafficWeight) -> Result<(), AdapterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable("load balancer".into()));
        }
        self.pushes.lock().push(weight);
        Ok(())
    }
}

pub struct Replication {
    pub report: Mutex<ReplicationReport>,
}

#[async_trait::async_trait]
impl ReplicationStatusSource for Replication {
    async fn replication_status(&self, _task: &str) -> Result<ReplicationReport, AdapterError> {
        Ok(*self.report.lock())
    }
}

pub struct Fixture {
    pub router: Arc<Router>,
    pub replication_source: Arc<Replication>,
    pub replication: Arc<ReplicationMonitor>,
    pub health: Arc<HealthProbe>,
    pub controller: Arc<TrafficController>,
    tick: Mutex<i64>,
}

pub fn phase(name: &str, new: u8) -> MigrationPhase {
    MigrationPhase::new(name, new, Duration::from_secs(5), 0.01).unwrap()
}

/// `100/0 → 90/10 → 50/50 → 0/100`, lag ceiling 5s, error-rate ceiling 1%
pub fn standard_plan() -> PhasePlan {
    PhasePlan::new(vec![
        phase("baseline", 0),
        phase("canary", 10),
        phase("half", 50),
        phase("full", 100),
    ])
    .unwrap()
}

pub fn settings() -> ControllerSettings {
    ControllerSettings {
        evaluation_window: Duration::from_secs(60),
        push_retry: RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            ..RetryPolicy::default()
        },
    }
}

impl Fixture {
    pub fn new(plan: PhasePlan) -> Self {
        let router = Arc::new(Router::default());
        let replication_source = Arc::new(Replication {
            report: Mutex::new(ReplicationReport::streaming(Duration::from_secs(2))),
        });
        let replication = Arc::new(ReplicationMonitor::new(
            replication_source.clone(),
            ReplicationSettings::default(),
        ));
        let health = Arc::new(HealthProbe::new(HealthSettings::default()));
        let gates = Gates {
            replication: replication.clone(),
            health: health.clone(),
        };
        let controller = Arc::new(TrafficController::new(
            "orders",
            plan,
            router.clone(),
            gates,
            settings(),
        ));
        Self {
            router,
            replication_source,
            replication,
            health,
            controller,
            tick: Mutex::new(0),
        }
    }

    pub fn gates(&self) -> Gates {
        Gates {
            replication: self.replication.clone(),
            health: self.health.clone(),
        }
    }

    /// Report `lag` from the replication task for three polls
    pub async fn settle_lag(&self, lag: Duration) {
        self.replication_source.report.lock().lag = lag;
        for _ in 0..3 {
            self.replication.poll_once().await.unwrap();
        }
    }

    pub async fn fail_replication(&self) {
        self.replication_source.report.lock().status = ReplicationStatus::Failed;
        self.replication.poll_once().await.unwrap();
    }

    /// Record three one-second snapshots per environment at the given
    /// error rates (errors per thousand requests)
    pub fn settle_health(&self, old_per_mille: u64, new_per_mille: u64) {
        for _ in 0..3 {
            let mut tick = self.tick.lock();
            *tick += 1;
            let at = DateTime::<Utc>::from_timestamp(1_700_000_000 + *tick, 0).unwrap();
            for (env, errors) in [
                (Environment::Old, old_per_mille),
                (Environment::New, new_per_mille),
            ] {
                self.health.record_snapshot(HealthSnapshot {
                    env,
                    timestamp: at,
                    request_count: 1000,
                    error_count: errors,
                    p99_latency: Duration::from_millis(40),
                });
            }
        }
    }

    /// Move the synthetic health clock past every evaluation window
    pub fn skip_health_window(&self) {
        *self.tick.lock() += 600;
    }

    /// Lag 2s and 0.1% errors on both sides
    pub async fn healthy(&self) {
        self.settle_lag(Duration::from_secs(2)).await;
        self.settle_health(1, 1);
    }
}
