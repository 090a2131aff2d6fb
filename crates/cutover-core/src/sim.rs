//! Seeded in-process simulation of every collaborator
//!
//! Lets the whole migration run without any cloud account: provisioning
//! returns synthetic outputs, replication converges over a few polls, and the
//! new environment's error rate can be made to spike once it carries a given
//! share of traffic. The same seed always produces the same run.

use crate::config::MigrationSettings;
use crate::orchestrator::Collaborators;
use crate::plan::{MigrationPlan, ReplicationSpec, StackRole, StackSpec};
use cutover_graph::StackId;
use cutover_signals::{
    AdapterError, Environment, HealthReading, HealthSettings, HealthSource, ReplicationReport,
    ReplicationStatus, ReplicationStatusSource,
};
use cutover_traffic::{
    ControllerSettings, GuardSettings, MigrationPhase, PhasePlan, RetryPolicy, TrafficRouter,
    TrafficWeight,
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Probability that a single provisioning attempt fails
    pub provision_failure_rate: f64,
    /// New-environment share at which its error rate degrades
    pub degrade_at: Option<u8>,
    /// Error rate of a healthy environment
    pub base_error_rate: f64,
    /// Error rate of the new environment once degraded
    pub degraded_error_rate: f64,
    /// Requests per health poll at 100% traffic
    pub requests_per_poll: u64,
    /// Lag reported once change streaming starts
    pub initial_lag: Duration,
    /// Polls spent in full load before streaming
    pub full_load_polls: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            provision_failure_rate: 0.0,
            degrade_at: None,
            base_error_rate: 0.002,
            degraded_error_rate: 0.2,
            requests_per_poll: 2_000,
            initial_lag: Duration::from_secs(30),
            full_load_polls: 2,
        }
    }
}

#[derive(Debug)]
struct World {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    weight: Mutex<TrafficWeight>,
    replication_polls: AtomicU32,
}

impl World {
    fn roll(&self) -> f64 {
        self.rng.lock().gen::<f64>()
    }

    fn jitter(&self, max_ms: u64) -> Duration {
        Duration::from_millis(self.rng.lock().gen_range(0..=max_ms))
    }
}

/// Handle on a simulated world
#[derive(Debug, Clone)]
pub struct Simulation {
    world: Arc<World>,
}

impl Simulation {
    /// New world seeded from `config.seed`, serving all traffic from old
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            world: Arc::new(World {
                config,
                rng: Mutex::new(rng),
                weight: Mutex::new(TrafficWeight::ALL_OLD),
                replication_polls: AtomicU32::new(0),
            }),
        }
    }

    /// Collaborators backed by this world
    #[must_use]
    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provisioner: Arc::new(SimProvisioner(Arc::clone(&self.world))),
            replication: Arc::new(SimReplication(Arc::clone(&self.world))),
            health: Arc::new(SimHealth(Arc::clone(&self.world))),
            router: Arc::new(SimRouter(Arc::clone(&self.world))),
        }
    }

    /// Weight the simulated load balancer is applying
    #[must_use]
    pub fn routed_weight(&self) -> TrafficWeight {
        *self.world.weight.lock()
    }
}

struct SimProvisioner(Arc<World>);

#[async_trait::async_trait]
impl crate::provision::Provisioner for SimProvisioner {
    async fn provision(
        &self,
        stack: &StackId,
        params: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, AdapterError> {
        tokio::time::sleep(self.0.jitter(50)).await;
        if self.0.roll() < self.0.config.provision_failure_rate {
            return Err(AdapterError::Unavailable(format!(
                "simulated outage creating {stack}"
            )));
        }
        let suffix: u32 = self.0.rng.lock().gen();
        let mut outputs = BTreeMap::new();
        outputs.insert("arn".to_string(), format!("arn:sim:{stack}:{suffix:08x}"));
        outputs.insert("inputs".to_string(), params.len().to_string());
        tracing::debug!(%stack, params = params.len(), "simulated stack created");
        Ok(outputs)
    }
}

struct SimReplication(Arc<World>);

#[async_trait::async_trait]
impl ReplicationStatusSource for SimReplication {
    async fn replication_status(&self, _task_id: &str) -> Result<ReplicationReport, AdapterError> {
        let polls = self.0.replication_polls.fetch_add(1, Ordering::SeqCst);
        let config = &self.0.config;
        if polls < config.full_load_polls {
            return Ok(ReplicationReport {
                lag: config.initial_lag,
                status: ReplicationStatus::FullLoadInProgress,
                error_count: 0,
            });
        }
        let halvings = (polls - config.full_load_polls).min(16);
        let lag = (config.initial_lag / 2u32.pow(halvings)).max(Duration::from_millis(300));
        Ok(ReplicationReport::streaming(lag + self.0.jitter(200)))
    }
}

struct SimHealth(Arc<World>);

#[async_trait::async_trait]
impl HealthSource for SimHealth {
    async fn health(&self, env: Environment) -> Result<HealthReading, AdapterError> {
        let weight = *self.0.weight.lock();
        let config = &self.0.config;
        let share = match env {
            Environment::Old => weight.old(),
            Environment::New => weight.new_share(),
        };
        let degraded = env == Environment::New
            && config.degrade_at.is_some_and(|at| weight.new_share() >= at);
        let rate = if degraded {
            config.degraded_error_rate
        } else {
            config.base_error_rate
        };

        // Synthetic health checks keep a trickle of traffic on an idle side
        let request_count = (config.requests_per_poll * u64::from(share) / 100).max(20);
        let expected = request_count as f64 * rate;
        let error_count = (expected * (0.5 + self.0.roll())).round() as u64;
        Ok(HealthReading {
            request_count,
            error_count: error_count.min(request_count),
            p99_latency: Duration::from_millis(80) + self.0.jitter(40),
        })
    }
}

struct SimRouter(Arc<World>);

#[async_trait::async_trait]
impl TrafficRouter for SimRouter {
    async fn set_weights(&self, weight: TrafficWeight) -> Result<(), AdapterError> {
        *self.0.weight.lock() = weight;
        tracing::debug!(%weight, "simulated load balancer updated");
        Ok(())
    }
}

/// Seven-stack plan with five phases and sub-second timings
///
/// # Errors
/// Never in practice; the phase table is fixed
pub fn demo_plan() -> Result<MigrationPlan, cutover_traffic::TrafficError> {
    let dwell = Duration::from_secs(1);
    let lag = Duration::from_secs(5);
    let phase = |name: &str, new: u8| {
        MigrationPhase::new(name, new, lag, 0.01).map(|p| p.with_min_dwell(dwell))
    };
    let phases = PhasePlan::new(vec![
        phase("baseline", 0)?,
        phase("canary", 5)?,
        phase("quarter", 25)?,
        phase("half", 50)?,
        phase("full", 100)?,
    ])?;

    let fast = Duration::from_millis(200);
    let settings = MigrationSettings::new()
        .with_tick_interval(fast)
        .with_poll_intervals(fast, fast)
        .with_traffic(ControllerSettings {
            evaluation_window: Duration::from_secs(2),
            push_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(100),
                backoff_multiplier: 2.0,
                attempt_timeout: Duration::from_millis(200),
            },
        })
        .with_guard(GuardSettings {
            hard_error_rate: 0.05,
            windows: vec![Duration::from_secs(1), Duration::from_secs(3)],
            max_poll_failures: 5,
        })
        .with_provision_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(5),
        });

    Ok(MigrationPlan {
        name: "demo".to_string(),
        stacks: vec![
            StackSpec::new("network", StackRole::Network, &[]),
            StackSpec::new("security", StackRole::Security, &["network"]),
            StackSpec::new("database", StackRole::Database, &["network", "security"]),
            StackSpec::new("replication", StackRole::Replication, &["database"]),
            StackSpec::new("compute", StackRole::Compute, &["database", "security"]),
            StackSpec::new("routing", StackRole::Routing, &["compute"]),
            StackSpec::new("monitoring", StackRole::Monitoring, &["routing"]),
        ],
        replication: ReplicationSpec {
            source: "demo-db-old".to_string(),
            target: "demo-db-new".to_string(),
        },
        phases,
        settings: MigrationSettings {
            health: HealthSettings {
                window_capacity: 60,
                min_samples: 3,
            },
            ..settings
        },
    })
}
