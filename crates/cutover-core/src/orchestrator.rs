//! Migration orchestrator
//!
//! Top-level sequencing of one migration:
//! 1. load the persisted run for the plan, returning terminal runs as-is
//!    except runs stopped by a failed stack, which are reopened
//! 2. provision stacks in dependency order, skipping ones already ready and
//!    retrying the one that failed
//! 3. start replication once the databases are ready, then health polling
//! 4. tick: rollback guard first, then a phase advance, until the controller
//!    completes or rolls back
//!
//! The run record is persisted after every change.

use crate::config::MigrationSettings;
use crate::error::OrchestratorError;
use crate::plan::MigrationPlan;
use crate::provision::Provisioner;
use crate::store::RunStore;
use cutover_graph::{StackGraph, StackId, StackStatus};
use cutover_signals::{
    Clock, HealthProbe, HealthSource, ReplicationMonitor, ReplicationStatusSource,
};
use cutover_traffic::{
    AbortSignal, Gates, GuardVerdict, MigrationRun, RollbackGuard, RunOutcome, StackFailure,
    TrafficController, TrafficError, TrafficRouter, TrafficWeight,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// External systems the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    /// Creates stacks
    pub provisioner: Arc<dyn Provisioner>,
    /// Replication task status
    pub replication: Arc<dyn ReplicationStatusSource>,
    /// Per-environment health
    pub health: Arc<dyn HealthSource>,
    /// Applies traffic weights
    pub router: Arc<dyn TrafficRouter>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Result of a run that reached an outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    /// Final run record
    pub run: MigrationRun,
    /// Stack statuses in declaration order
    pub stacks: Vec<(StackId, StackStatus)>,
    /// Whether the router acknowledged the final weight
    pub routing_in_sync: bool,
}

impl MigrationReport {
    /// Terminal outcome
    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.run.outcome
    }

    /// Final intended weight
    #[must_use]
    pub fn final_weight(&self) -> TrafficWeight {
        self.run.weight
    }
}

/// Drives a [`MigrationPlan`] from empty infrastructure to a cut-over (or
/// rolled back) environment
pub struct MigrationOrchestrator {
    collaborators: Collaborators,
    store: Arc<dyn RunStore>,
    abort: AbortSignal,
    clock: Clock,
    graph: RwLock<StackGraph>,
}

impl std::fmt::Debug for MigrationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationOrchestrator")
            .field("abort", &self.abort)
            .field("stacks", &self.graph.read().len())
            .finish_non_exhaustive()
    }
}

impl MigrationOrchestrator {
    /// Create an orchestrator that is never aborted externally
    #[must_use]
    pub fn new(collaborators: Collaborators, store: Arc<dyn RunStore>) -> Self {
        Self {
            collaborators,
            store,
            abort: AbortSignal::never(),
            clock: Clock::new(),
            graph: RwLock::new(StackGraph::new()),
        }
    }

    /// Observe `signal` at every tick and before every provisioning step
    #[must_use]
    pub fn with_abort(mut self, signal: AbortSignal) -> Self {
        self.abort = signal;
        self
    }

    /// Stack statuses of the most recent run, in declaration order
    ///
    /// Still available after `run` returned an error.
    #[must_use]
    pub fn stack_statuses(&self) -> Vec<(StackId, StackStatus)> {
        self.graph.read().statuses()
    }

    /// Execute or resume `plan`
    ///
    /// # Errors
    /// - `Config`/`Graph` for plan mistakes, before anything is provisioned
    /// - `ProvisioningFailed` when a stack fails; the run is persisted as
    ///   `Aborted` with the failed stack recorded, and the next call retries
    ///   that stack without touching the ready ones
    /// - `Store` when the run cannot be persisted
    pub async fn run(&self, plan: &MigrationPlan) -> Result<MigrationReport, OrchestratorError> {
        plan.validate()?;
        let settings = &plan.settings;
        let mut graph = plan.graph()?;
        let order = graph.topological_order()?;

        let mut persisted = self.store.load(&plan.name).await?;
        if let Some(run) = &persisted {
            restore_graph(&mut graph, &order, run)?;
        }
        *self.graph.write() = graph;

        if let Some(run) = persisted.as_mut().filter(|r| is_retryable_failure(r)) {
            if let Some(failure) = run.failed_stack.take() {
                tracing::info!(
                    plan = %plan.name,
                    run_id = %run.run_id,
                    stack = %failure.stack,
                    previous = %failure.reason,
                    "retrying failed stack"
                );
            }
            run.outcome = None;
            run.touch(self.clock.now());
            self.store.save(run).await?;
        }

        let mut run = match persisted {
            Some(run) if run.is_terminal() => {
                tracing::info!(plan = %plan.name, run_id = %run.run_id, summary = %run.summary(), "run already finished");
                return Ok(self.report(run, false));
            }
            Some(run) => {
                tracing::info!(
                    plan = %plan.name,
                    run_id = %run.run_id,
                    phase = run.phase_index,
                    ready = run.ready_stacks.len(),
                    "resuming run"
                );
                run
            }
            None => {
                let run = MigrationRun::new(plan.name.clone(), &plan.phases, self.clock.now());
                tracing::info!(plan = %plan.name, run_id = %run.run_id, stacks = order.len(), "starting run");
                self.store.save(&run).await?;
                run
            }
        };

        let replication = Arc::new(ReplicationMonitor::new(
            Arc::clone(&self.collaborators.replication),
            settings.replication,
        ));

        for id in &order {
            self.maybe_start_replication(plan, &replication)?;
            if self.graph.read().status(id.as_str()) == Some(StackStatus::Ready) {
                continue;
            }
            if let Some(reason) = self.abort.reason() {
                tracing::warn!(plan = %plan.name, next = %id, %reason, "aborted during provisioning");
                replication.stop();
                run.outcome = Some(RunOutcome::Aborted);
                run.touch(self.clock.now());
                self.store.save(&run).await?;
                return Ok(self.report(run, false));
            }
            self.provision(id, settings, &mut run).await?;
        }
        if !replication.is_running() {
            replication.start(
                plan.replication.source.clone(),
                plan.replication.target.clone(),
                settings.replication_poll_interval,
            )?;
        }

        let result = self.shift(plan, run, &replication).await;
        replication.stop();
        result
    }

    fn maybe_start_replication(
        &self,
        plan: &MigrationPlan,
        replication: &Arc<ReplicationMonitor>,
    ) -> Result<(), OrchestratorError> {
        let has_databases = plan.database_stacks().next().is_some();
        if has_databases && !replication.is_running() && plan.databases_ready(&self.graph.read()) {
            replication.start(
                plan.replication.source.clone(),
                plan.replication.target.clone(),
                plan.settings.replication_poll_interval,
            )?;
        }
        Ok(())
    }

    async fn provision(
        &self,
        id: &StackId,
        settings: &MigrationSettings,
        run: &mut MigrationRun,
    ) -> Result<(), OrchestratorError> {
        let params = {
            let mut graph = self.graph.write();
            graph.mark_in_progress(id.as_str())?;
            graph.dependency_outputs(id.as_str())?
        };

        let provisioner = Arc::clone(&self.collaborators.provisioner);
        let result = settings
            .provision_retry
            .run("provision", |_| {
                let provisioner = Arc::clone(&provisioner);
                let params = params.clone();
                let id = id.clone();
                async move { provisioner.provision(&id, &params).await }
            })
            .await;

        match result {
            Ok(outputs) => {
                self.graph.write().mark_ready(id.as_str(), outputs.clone())?;
                run.ready_stacks.insert(id.clone(), outputs);
                run.touch(self.clock.now());
                self.store.save(run).await?;
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                self.graph.write().mark_failed(id.as_str(), reason.clone())?;
                run.failed_stack = Some(StackFailure {
                    stack: id.clone(),
                    reason: reason.clone(),
                });
                run.outcome = Some(RunOutcome::Aborted);
                run.touch(self.clock.now());
                self.store.save(run).await?;
                Err(OrchestratorError::ProvisioningFailed {
                    node: id.clone(),
                    reason,
                })
            }
        }
    }

    async fn shift(
        &self,
        plan: &MigrationPlan,
        run: MigrationRun,
        replication: &Arc<ReplicationMonitor>,
    ) -> Result<MigrationReport, OrchestratorError> {
        let settings = &plan.settings;
        if let Some(blind) = settings.guard_blind_spot() {
            tracing::warn!(
                push_budget_ms = blind.as_millis() as u64,
                "advance push retries can outlast the shortest guard window"
            );
        }
        let health = Arc::new(HealthProbe::new(settings.health));
        let poller = health.spawn_poller(
            Arc::clone(&self.collaborators.health),
            settings.health_poll_interval,
        );

        let controller = Arc::new(TrafficController::resume(
            run,
            plan.phases.clone(),
            Arc::clone(&self.collaborators.router),
            Gates {
                replication: Arc::clone(replication),
                health: Arc::clone(&health),
            },
            settings.traffic.clone(),
        )?);
        if let Err(err) = controller.resync_routing().await {
            tracing::warn!(error = %err, "could not align routing with the starting phase");
        }
        let guard = RollbackGuard::new(
            Arc::clone(&controller),
            Arc::clone(replication),
            Arc::clone(&health),
            self.abort.clone(),
            settings.guard.clone(),
        );

        let outcome = self
            .supervise(&controller, &guard, settings.tick_interval)
            .await;
        poller.abort();
        outcome?;

        let run = controller.run();
        tracing::info!(plan = %plan.name, run_id = %run.run_id, summary = %run.summary(), "run finished");
        Ok(self.report(run, controller.routing_in_sync()))
    }

    /// Tick until the controller is terminal
    ///
    /// The guard runs before the advance on each tick and the advance is
    /// awaited inline, so the guard does not run while an advance push is
    /// retrying. `guard_blind_spot` flags settings where that gap outlasts
    /// a guard window.
    async fn supervise(
        &self,
        controller: &TrafficController,
        guard: &RollbackGuard,
        tick: Duration,
    ) -> Result<(), OrchestratorError> {
        let mut saved = controller.run().sequence;
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if let GuardVerdict::RolledBack(record) = guard.evaluate().await {
                tracing::error!(
                    phase = record.phase_index,
                    reason = %record.reason,
                    "migration rolled back"
                );
            }

            if !controller.is_terminal() {
                match controller.advance_phase().await {
                    Ok(weight) => tracing::info!(%weight, "phase advanced"),
                    Err(TrafficError::PhaseGateNotSatisfied(gate)) => {
                        tracing::debug!(reason = %gate, "waiting on phase gate");
                    }
                    Err(TrafficError::AlreadyTerminal(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            }

            let run = controller.run();
            if run.sequence != saved {
                self.store.save(&run).await?;
                saved = run.sequence;
            }
            if controller.is_terminal() {
                return Ok(());
            }
        }
    }

    fn report(&self, run: MigrationRun, routing_in_sync: bool) -> MigrationReport {
        MigrationReport {
            run,
            stacks: self.stack_statuses(),
            routing_in_sync,
        }
    }
}

/// A run that stopped on a failed stack; the next `run` retries that stack
fn is_retryable_failure(run: &MigrationRun) -> bool {
    run.outcome == Some(RunOutcome::Aborted) && run.failed_stack.is_some()
}

/// Replay the persisted provisioning progress onto a fresh graph
fn restore_graph(
    graph: &mut StackGraph,
    order: &[StackId],
    run: &MigrationRun,
) -> Result<(), OrchestratorError> {
    for id in order {
        if let Some(outputs) = run.ready_stacks.get(id) {
            graph.mark_in_progress(id.as_str())?;
            graph.mark_ready(id.as_str(), outputs.clone())?;
        }
    }
    if let Some(failure) = &run.failed_stack {
        graph.mark_in_progress(failure.stack.as_str())?;
        graph.mark_failed(failure.stack.as_str(), failure.reason.clone())?;
    }
    Ok(())
}
