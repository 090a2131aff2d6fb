use chrono::Utc;
use cutover_core::{FileRunStore, RunStore, StoreError};
use cutover_graph::StackId;
use cutover_test_utils::{migration_plan, Harness};
use cutover_traffic::{MigrationRun, RunOutcome, TrafficWeight};
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;

fn fresh_run() -> MigrationRun {
    MigrationRun::new("orders", &migration_plan().phases, Utc::now())
}

#[tokio::test]
async fn file_store_round_trips_a_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRunStore::new(dir.path().join("runs"));
    assert_eq!(store.load("orders").await.unwrap(), None);

    let mut run = fresh_run();
    let mut outputs = BTreeMap::new();
    outputs.insert("vpc_id".to_string(), "vpc-1234".to_string());
    run.ready_stacks.insert(StackId::from("network"), outputs);
    run.touch(Utc::now());
    store.save(&run).await.unwrap();

    assert_eq!(store.load("orders").await.unwrap(), Some(run));
    let leftovers: Vec<_> = std::fs::read_dir(store.dir())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(leftovers, vec!["orders.json".to_string()]);
}

#[tokio::test]
async fn file_store_replaces_records_in_a_nested_directory() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRunStore::new(dir.path().join("state").join("runs"));

    let mut run = fresh_run();
    store.save(&run).await.unwrap();
    run.weight = TrafficWeight::new(90, 10).unwrap();
    run.touch(Utc::now());
    store.save(&run).await.unwrap();

    assert_eq!(store.load("orders").await.unwrap(), Some(run));
    let entries = std::fs::read_dir(store.dir()).unwrap().count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn file_store_rejects_stale_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRunStore::new(dir.path());

    let mut run = fresh_run();
    run.sequence = 5;
    store.save(&run).await.unwrap();

    let mut stale = run.clone();
    stale.sequence = 2;
    stale.weight = TrafficWeight::ALL_NEW;
    let err = store.save(&stale).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::StaleSequence { stored: 5, attempted: 2, .. }
    ));
    assert_eq!(store.load("orders").await.unwrap(), Some(run));
}

#[tokio::test]
async fn corrupt_record_is_reported_not_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRunStore::new(dir.path());
    std::fs::write(dir.path().join("orders.json"), b"{\"run_id\": ").unwrap();

    assert!(matches!(
        store.load("orders").await,
        Err(StoreError::Malformed(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn orchestrator_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let plan = migration_plan();

    // Interrupted after provisioning two stacks
    let mut run = fresh_run();
    for id in ["network", "database"] {
        let mut outputs = BTreeMap::new();
        outputs.insert("id".to_string(), format!("{id}-0001"));
        run.ready_stacks.insert(StackId::from(id), outputs);
        run.touch(Utc::now());
    }
    let store = Arc::new(FileRunStore::new(dir.path()));
    store.save(&run).await.unwrap();

    let harness = Harness::healthy();
    let orchestrator =
        cutover_core::MigrationOrchestrator::new(harness.collaborators(), store.clone());
    let report = orchestrator.run(&plan).await.unwrap();

    assert_eq!(report.outcome(), Some(RunOutcome::Completed));
    assert_eq!(
        harness.provisioner.provisioned(),
        vec![
            StackId::from("replication"),
            StackId::from("compute"),
            StackId::from("routing")
        ]
    );
    let compute = harness.provisioner.params_for("compute").unwrap();
    assert_eq!(compute.get("database.id").map(String::as_str), Some("database-0001"));

    let stored = store.load("orders").await.unwrap().unwrap();
    assert_eq!(stored.run_id, run.run_id);
    assert_eq!(stored.outcome, Some(RunOutcome::Completed));
    assert!(stored.sequence > run.sequence);
}
