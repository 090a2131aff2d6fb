//! Testing utilities for the cutover workspace
//!
//! Scriptable collaborators and a standard plan for orchestrator tests.

#![allow(missing_docs)]

use cutover_core::{
    Collaborators, MemoryRunStore, MigrationOrchestrator, MigrationPlan, MigrationSettings,
    Provisioner, ReplicationSpec, StackRole, StackSpec,
};
use cutover_graph::StackId;
use cutover_signals::{
    AdapterError, Environment, HealthReading, HealthSettings, HealthSource, ReplicationReport,
    ReplicationStatusSource,
};
use cutover_traffic::{
    ControllerSettings, GuardSettings, MigrationPhase, PhasePlan, RetryPolicy, TrafficRouter,
    TrafficWeight,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub type Outputs = BTreeMap<String, String>;

/// Provisioner that records every call and fails the stacks it is told to
#[derive(Debug, Default)]
pub struct ScriptedProvisioner {
    failing: Mutex<HashSet<StackId>>,
    calls: Mutex<Vec<(StackId, Outputs)>>,
}

impl ScriptedProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every attempt to provision `stack`
    pub fn fail_stack(&self, stack: &str) {
        self.failing.lock().insert(StackId::from(stack));
    }

    /// Let `stack` provision again
    pub fn recover_stack(&self, stack: &str) {
        self.failing.lock().remove(&StackId::from(stack));
    }

    /// `(stack, params)` for every call, in call order
    pub fn calls(&self) -> Vec<(StackId, Outputs)> {
        self.calls.lock().clone()
    }

    pub fn provisioned(&self) -> Vec<StackId> {
        self.calls.lock().iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn params_for(&self, stack: &str) -> Option<Outputs> {
        self.calls
            .lock()
            .iter()
            .find(|(id, _)| id.as_str() == stack)
            .map(|(_, params)| params.clone())
    }
}

#[async_trait::async_trait]
impl Provisioner for ScriptedProvisioner {
    async fn provision(&self, stack: &StackId, params: &Outputs) -> Result<Outputs, AdapterError> {
        self.calls.lock().push((stack.clone(), params.clone()));
        if self.failing.lock().contains(stack) {
            return Err(AdapterError::Rejected(format!("quota exceeded for {stack}")));
        }
        let mut outputs = Outputs::new();
        outputs.insert("id".to_string(), format!("{stack}-0001"));
        Ok(outputs)
    }
}

type ReplicationScript = dyn Fn(u32) -> Result<ReplicationReport, AdapterError> + Send + Sync;

/// Replication source answering from a function of the poll number
pub struct ScriptedReplication {
    polls: AtomicU32,
    script: Box<ReplicationScript>,
}

impl ScriptedReplication {
    pub fn new(
        script: impl Fn(u32) -> Result<ReplicationReport, AdapterError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            polls: AtomicU32::new(0),
            script: Box::new(script),
        }
    }

    /// Streaming with 2s lag from the first poll
    pub fn caught_up() -> Self {
        Self::new(|_| Ok(ReplicationReport::streaming(Duration::from_secs(2))))
    }

    pub fn polls(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ReplicationStatusSource for ScriptedReplication {
    async fn replication_status(&self, _task_id: &str) -> Result<ReplicationReport, AdapterError> {
        let poll = self.polls.fetch_add(1, Ordering::SeqCst);
        (self.script)(poll)
    }
}

/// Router that records acknowledged weights
#[derive(Debug)]
pub struct RecordingRouter {
    pushes: Mutex<Vec<TrafficWeight>>,
    current: Mutex<TrafficWeight>,
    failing: AtomicBool,
}

impl Default for RecordingRouter {
    fn default() -> Self {
        Self {
            pushes: Mutex::new(Vec::new()),
            current: Mutex::new(TrafficWeight::ALL_OLD),
            failing: AtomicBool::new(false),
        }
    }
}

impl RecordingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> Vec<TrafficWeight> {
        self.pushes.lock().clone()
    }

    /// Last acknowledged weight
    pub fn current(&self) -> TrafficWeight {
        *self.current.lock()
    }
}

#[async_trait::async_trait]
impl TrafficRouter for RecordingRouter {
    async fn set_weights(&self, weight: TrafficWeight) -> Result<(), AdapterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable("load balancer".into()));
        }
        self.pushes.lock().push(weight);
        *self.current.lock() = weight;
        Ok(())
    }
}

type HealthScript =
    dyn Fn(Environment, TrafficWeight) -> Result<HealthReading, AdapterError> + Send + Sync;

/// Health source answering from a function of the environment and the
/// weight the router currently applies
pub struct ScriptedHealth {
    router: Arc<RecordingRouter>,
    script: Box<HealthScript>,
}

impl ScriptedHealth {
    pub fn new(
        router: Arc<RecordingRouter>,
        script: impl Fn(Environment, TrafficWeight) -> Result<HealthReading, AdapterError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            router,
            script: Box::new(script),
        }
    }

    /// Both sides at 0.1% errors
    pub fn healthy(router: Arc<RecordingRouter>) -> Self {
        Self::new(router, |_, _| Ok(reading(1000, 1)))
    }

    /// New side at 20% errors once it carries at least `share`%
    pub fn degrading_at(router: Arc<RecordingRouter>, share: u8) -> Self {
        Self::new(router, move |env, weight| {
            if env == Environment::New && weight.new_share() >= share {
                Ok(reading(1000, 200))
            } else {
                Ok(reading(1000, 1))
            }
        })
    }
}

#[async_trait::async_trait]
impl HealthSource for ScriptedHealth {
    async fn health(&self, env: Environment) -> Result<HealthReading, AdapterError> {
        (self.script)(env, self.router.current())
    }
}

pub fn reading(requests: u64, errors: u64) -> HealthReading {
    HealthReading {
        request_count: requests,
        error_count: errors,
        p99_latency: Duration::from_millis(90),
    }
}

/// Scripted collaborators plus an in-memory store
pub struct Harness {
    pub provisioner: Arc<ScriptedProvisioner>,
    pub replication: Arc<ScriptedReplication>,
    pub health: Arc<ScriptedHealth>,
    pub router: Arc<RecordingRouter>,
    pub store: Arc<MemoryRunStore>,
}

impl Harness {
    /// Everything healthy and caught up
    pub fn healthy() -> Self {
        let router = Arc::new(RecordingRouter::new());
        Self::with(
            ScriptedReplication::caught_up(),
            ScriptedHealth::healthy(Arc::clone(&router)),
            router,
        )
    }

    pub fn with(
        replication: ScriptedReplication,
        health: ScriptedHealth,
        router: Arc<RecordingRouter>,
    ) -> Self {
        Self {
            provisioner: Arc::new(ScriptedProvisioner::new()),
            replication: Arc::new(replication),
            health: Arc::new(health),
            router,
            store: Arc::new(MemoryRunStore::new()),
        }
    }

    pub fn with_store(mut self, store: MemoryRunStore) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provisioner: self.provisioner.clone(),
            replication: self.replication.clone(),
            health: self.health.clone(),
            router: self.router.clone(),
        }
    }

    pub fn orchestrator(&self) -> MigrationOrchestrator {
        MigrationOrchestrator::new(self.collaborators(), self.store.clone())
    }
}

pub fn phase(name: &str, new: u8) -> MigrationPhase {
    MigrationPhase::new(name, new, Duration::from_secs(5), 0.01)
        .unwrap()
        .with_min_dwell(Duration::from_secs(5))
}

/// `network → database → replication → compute → routing`, phases
/// `100/0 → 90/10 → 50/50 → 0/100`, 5s dwell, 1s ticks and polls
pub fn migration_plan() -> MigrationPlan {
    let second = Duration::from_secs(1);
    let settings = MigrationSettings::new()
        .with_tick_interval(second)
        .with_poll_intervals(second, second)
        .with_traffic(ControllerSettings {
            evaluation_window: Duration::from_secs(10),
            push_retry: RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                ..RetryPolicy::default()
            }
            .with_max_attempts(3)
            .with_attempt_timeout(second),
        })
        .with_guard(GuardSettings {
            hard_error_rate: 0.05,
            windows: vec![Duration::from_secs(5), Duration::from_secs(10)],
            max_poll_failures: 5,
        })
        .with_provision_retry(RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(60),
        });

    MigrationPlan {
        name: "orders".to_string(),
        stacks: vec![
            StackSpec::new("network", StackRole::Network, &[]),
            StackSpec::new("database", StackRole::Database, &["network"]),
            StackSpec::new("replication", StackRole::Replication, &["database"]),
            StackSpec::new("compute", StackRole::Compute, &["database"]),
            StackSpec::new("routing", StackRole::Routing, &["compute"]),
        ],
        replication: ReplicationSpec {
            source: "orders-db-old".to_string(),
            target: "orders-db-new".to_string(),
        },
        phases: PhasePlan::new(vec![
            phase("baseline", 0),
            phase("canary", 10),
            phase("half", 50),
            phase("full", 100),
        ])
        .unwrap(),
        settings: MigrationSettings {
            health: HealthSettings {
                window_capacity: 60,
                min_samples: 3,
            },
            ..settings
        },
    }
}
