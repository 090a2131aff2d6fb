//! End-to-end runs against scripted collaborators, on paused time

use chrono::Utc;
use cutover_core::{MemoryRunStore, OrchestratorError, RunStore};
use cutover_graph::{StackId, StackStatus};
use cutover_signals::{Environment, ReplicationReport, ReplicationStatus};
use cutover_test_utils::{migration_plan, Harness, RecordingRouter, ScriptedHealth, ScriptedReplication};
use cutover_traffic::{abort_pair, MigrationRun, RollbackReason, RunOutcome, TrafficWeight};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn weight(old: u8, new: u8) -> TrafficWeight {
    TrafficWeight::new(old, new).unwrap()
}

fn ids(names: &[&str]) -> Vec<StackId> {
    names.iter().map(|n| StackId::from(*n)).collect()
}

#[tokio::test(start_paused = true)]
async fn healthy_run_cuts_over_completely() {
    let harness = Harness::healthy();
    let report = harness.orchestrator().run(&migration_plan()).await.unwrap();

    assert_eq!(report.outcome(), Some(RunOutcome::Completed));
    assert_eq!(report.final_weight(), TrafficWeight::ALL_NEW);
    assert!(report.routing_in_sync);
    assert!(report.stacks.iter().all(|(_, s)| *s == StackStatus::Ready));
    assert_eq!(
        harness.router.pushes(),
        vec![weight(100, 0), weight(90, 10), weight(50, 50), weight(0, 100)]
    );
    assert_eq!(
        harness.provisioner.provisioned(),
        ids(&["network", "database", "replication", "compute", "routing"])
    );
    assert!(harness.replication.polls() >= 3);
}

#[tokio::test(start_paused = true)]
async fn stacks_receive_their_dependencies_outputs() {
    let harness = Harness::healthy();
    harness.orchestrator().run(&migration_plan()).await.unwrap();

    let params = harness.provisioner.params_for("compute").unwrap();
    assert_eq!(params.get("database.id").map(String::as_str), Some("database-0001"));
    assert!(harness.provisioner.params_for("network").unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn every_save_moves_the_sequence_forward() {
    let harness = Harness::healthy();
    harness.orchestrator().run(&migration_plan()).await.unwrap();

    let history = harness.store.history();
    assert!(history.len() > 5);
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    let last = history.last().unwrap();
    assert_eq!(last.outcome, Some(RunOutcome::Completed));
    assert_eq!(last.ready_stacks.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn health_breach_at_half_returns_traffic_to_old() {
    let router = Arc::new(RecordingRouter::new());
    let harness = Harness::with(
        ScriptedReplication::caught_up(),
        ScriptedHealth::degrading_at(Arc::clone(&router), 50),
        router,
    );
    let report = harness.orchestrator().run(&migration_plan()).await.unwrap();

    assert_eq!(report.outcome(), Some(RunOutcome::RolledBack));
    assert_eq!(report.final_weight(), TrafficWeight::ALL_OLD);
    let rollback = report.run.rollback.clone().unwrap();
    assert_eq!(rollback.phase_index, 2);
    assert!(matches!(
        rollback.reason,
        RollbackReason::HealthBreach { env: Environment::New, .. }
    ));
    assert!(report.run.summary().contains("health breach"));
    assert_eq!(
        harness.router.pushes(),
        vec![weight(100, 0), weight(90, 10), weight(50, 50), weight(100, 0)]
    );

    let stored = harness.store.load("orders").await.unwrap().unwrap();
    assert_eq!(stored.outcome, Some(RunOutcome::RolledBack));
}

#[tokio::test(start_paused = true)]
async fn replication_failure_rolls_back() {
    let router = Arc::new(RecordingRouter::new());
    let replication = ScriptedReplication::new(|poll| {
        if poll < 8 {
            Ok(ReplicationReport::streaming(Duration::from_secs(1)))
        } else {
            Ok(ReplicationReport {
                lag: Duration::from_secs(1),
                status: ReplicationStatus::Failed,
                error_count: 1,
            })
        }
    });
    let harness = Harness::with(
        replication,
        ScriptedHealth::healthy(Arc::clone(&router)),
        router,
    );
    let report = harness.orchestrator().run(&migration_plan()).await.unwrap();

    assert_eq!(report.outcome(), Some(RunOutcome::RolledBack));
    let rollback = report.run.rollback.unwrap();
    assert_eq!(rollback.reason, RollbackReason::ReplicationFailed);
    assert_eq!(rollback.phase_index, 1);
    assert_eq!(harness.router.current(), TrafficWeight::ALL_OLD);
}

#[tokio::test(start_paused = true)]
async fn provisioning_failure_aborts_without_touching_traffic() {
    let harness = Harness::healthy();
    harness.provisioner.fail_stack("database");
    let orchestrator = harness.orchestrator();

    let err = orchestrator.run(&migration_plan()).await.unwrap_err();
    assert!(matches!(
        &err,
        OrchestratorError::ProvisioningFailed { node, .. } if node.as_str() == "database"
    ));
    assert!(!err.is_configuration_error());

    let statuses: BTreeMap<_, _> = orchestrator.stack_statuses().into_iter().collect();
    assert_eq!(statuses[&StackId::from("network")], StackStatus::Ready);
    assert_eq!(statuses[&StackId::from("database")], StackStatus::Failed);
    for pending in ["replication", "compute", "routing"] {
        assert_eq!(statuses[&StackId::from(pending)], StackStatus::Pending);
    }
    assert!(harness.router.pushes().is_empty());
    assert_eq!(harness.replication.polls(), 0);

    let stored = harness.store.load("orders").await.unwrap().unwrap();
    assert_eq!(stored.outcome, Some(RunOutcome::Aborted));
    assert_eq!(
        stored.failed_stack.map(|f| f.stack),
        Some(StackId::from("database"))
    );
    assert!(stored.ready_stacks.contains_key(&StackId::from("network")));
}

#[tokio::test(start_paused = true)]
async fn failed_stack_is_retried_on_the_next_run() {
    let harness = Harness::healthy();
    let plan = migration_plan();
    harness.provisioner.fail_stack("database");
    let first = harness.orchestrator().run(&plan).await.unwrap_err();
    assert!(matches!(first, OrchestratorError::ProvisioningFailed { .. }));
    let aborted = harness.store.load("orders").await.unwrap().unwrap();
    let calls_before = harness.provisioner.calls().len();

    harness.provisioner.recover_stack("database");
    let report = harness.orchestrator().run(&plan).await.unwrap();

    assert_eq!(report.outcome(), Some(RunOutcome::Completed));
    assert_eq!(report.run.run_id, aborted.run_id);
    assert_eq!(report.run.failed_stack, None);
    assert!(report.stacks.iter().all(|(_, s)| *s == StackStatus::Ready));
    let retried: Vec<StackId> = harness.provisioner.provisioned()[calls_before..].to_vec();
    assert_eq!(retried, ids(&["database", "replication", "compute", "routing"]));
    assert_eq!(harness.router.current(), TrafficWeight::ALL_NEW);

    let history = harness.store.history();
    assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    let reopened = history
        .iter()
        .find(|r| r.sequence > aborted.sequence)
        .unwrap();
    assert_eq!(reopened.outcome, None);
    assert_eq!(reopened.failed_stack, None);
}

#[tokio::test(start_paused = true)]
async fn aborted_runs_without_a_failed_stack_stay_finished() {
    let harness = Harness::healthy();
    let plan = migration_plan();
    let (handle, signal) = abort_pair();
    handle.abort("change freeze");
    harness.orchestrator().with_abort(signal).run(&plan).await.unwrap();

    let second = harness.orchestrator().run(&plan).await.unwrap();
    assert_eq!(second.outcome(), Some(RunOutcome::Aborted));
    assert!(harness.provisioner.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resumes_from_a_persisted_phase() {
    let plan = migration_plan();
    let mut persisted = MigrationRun::new("orders", &plan.phases, Utc::now());
    for stack in &plan.stacks {
        let mut outputs = BTreeMap::new();
        outputs.insert("id".to_string(), format!("{}-0001", stack.id));
        persisted.ready_stacks.insert(stack.id.clone(), outputs);
    }
    persisted.phase_index = 2;
    persisted.phase_name = "half".to_string();
    persisted.weight = weight(50, 50);
    persisted.sequence = 7;

    let harness = Harness::healthy().with_store(MemoryRunStore::with_run(persisted.clone()));
    let report = harness.orchestrator().run(&plan).await.unwrap();

    assert!(harness.provisioner.calls().is_empty());
    assert_eq!(report.outcome(), Some(RunOutcome::Completed));
    assert_eq!(report.run.run_id, persisted.run_id);
    assert_eq!(harness.router.pushes(), vec![weight(50, 50), weight(0, 100)]);
    assert!(harness.store.history().iter().all(|r| r.sequence > 7));
}

#[tokio::test(start_paused = true)]
async fn finished_runs_are_returned_as_is() {
    let harness = Harness::healthy();
    let plan = migration_plan();
    let first = harness.orchestrator().run(&plan).await.unwrap();
    let calls = harness.provisioner.calls().len();
    let pushes = harness.router.pushes().len();

    let second = harness.orchestrator().run(&plan).await.unwrap();
    assert_eq!(second.run, first.run);
    assert_eq!(harness.provisioner.calls().len(), calls);
    assert_eq!(harness.router.pushes().len(), pushes);
}

#[tokio::test(start_paused = true)]
async fn abort_before_start_provisions_nothing() {
    let harness = Harness::healthy();
    let (handle, signal) = abort_pair();
    handle.abort("change freeze");

    let report = harness
        .orchestrator()
        .with_abort(signal)
        .run(&migration_plan())
        .await
        .unwrap();

    assert_eq!(report.outcome(), Some(RunOutcome::Aborted));
    assert!(harness.provisioner.calls().is_empty());
    assert!(harness.router.pushes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn abort_while_shifting_rolls_back() {
    let harness = Harness::healthy();
    let (handle, signal) = abort_pair();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        handle.abort("operator");
    });

    let report = harness
        .orchestrator()
        .with_abort(signal)
        .run(&migration_plan())
        .await
        .unwrap();

    assert_eq!(report.outcome(), Some(RunOutcome::RolledBack));
    let rollback = report.run.rollback.unwrap();
    assert_eq!(
        rollback.reason,
        RollbackReason::ExternalAbort {
            reason: "operator".to_string()
        }
    );
    assert_eq!(rollback.phase_index, 1);
    assert_eq!(harness.router.current(), TrafficWeight::ALL_OLD);
}

#[tokio::test(start_paused = true)]
async fn cyclic_plans_fail_before_provisioning() {
    let harness = Harness::healthy();
    let mut plan = migration_plan();
    plan.stacks[0].depends_on.push(StackId::from("routing"));

    let err = harness.orchestrator().run(&plan).await.unwrap_err();
    assert!(err.is_configuration_error());
    assert!(harness.provisioner.calls().is_empty());
    assert!(harness.store.history().is_empty());
}
