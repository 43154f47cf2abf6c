//! End-to-end runs against the in-memory provider and local state.

use std::sync::Arc;
use std::time::Duration;

use halyard::config::{ConfigParser, ResourceSpec, StackSpec};
use halyard::engine::{Engine, Goal};
use halyard::error::ProviderError;
use halyard::executor::NodeStatus;
use halyard::planner::ChangeAction;
use halyard::provider::{MemoryProvider, ProviderOp};
use halyard::state::{LocalStateStore, LockInfo, StateStore};
use tempfile::TempDir;

const STACK: &str = r#"
project:
  name: shop
  environment: test

execution:
  concurrency: 2
  max_attempts: 2
  initial_backoff_ms: 1
  max_backoff_ms: 2

types:
  network:
    immutable: [cidr]
    replace: create_before_delete

resources:
  - id: n1
    type: network
    properties:
      cidr: 10.0.0.0/16
  - id: i1
    type: instance
    properties:
      network: { ref: n1.id }
      size: small
  - id: logs
    type: bucket
"#;

fn parse(yaml: &str) -> StackSpec {
    ConfigParser::new().parse_yaml(yaml, None).unwrap()
}

fn engine(temp: &TempDir, provider: &Arc<MemoryProvider>, yaml: &str) -> Engine {
    Engine::new(
        parse(yaml),
        Arc::new(LocalStateStore::with_base_dir(temp.path())),
        provider.clone(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_apply_then_replan_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let engine = engine(&temp, &provider, STACK);

    let (plan, result) = engine.run("it", Goal::Converge).await.unwrap();
    assert_eq!(plan.count(ChangeAction::Create), 3);
    assert!(result.succeeded());

    let replan = engine.plan(Goal::Converge).await.unwrap();
    assert!(replan.is_empty());

    let (_, second) = engine.run("it", Goal::Converge).await.unwrap();
    assert!(second.deltas.is_empty());
    assert_eq!(provider.calls().await.len(), 3);
}

#[tokio::test]
async fn test_immutable_change_replaces_and_updates_dependent() {
    let temp = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    engine(&temp, &provider, STACK).run("it", Goal::Converge).await.unwrap();

    let changed = STACK.replace("10.0.0.0/16", "10.1.0.0/16");
    let engine = engine(&temp, &provider, &changed);
    let (plan, result) = engine.run("it", Goal::Converge).await.unwrap();

    assert_eq!(plan.change("n1").unwrap().action, ChangeAction::Replace);
    assert_eq!(plan.change("i1").unwrap().action, ChangeAction::Update);
    assert_eq!(plan.change("logs").unwrap().action, ChangeAction::NoOp);
    assert!(result.succeeded());

    let state = engine.store().load().await.unwrap();
    assert_eq!(state["n1"].provider_id, "network-2");
    assert_eq!(state["i1"].outputs["network"], "network-2");
}

#[tokio::test]
async fn test_failed_branch_is_retried_on_next_run() {
    let temp = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    provider
        .fail(ProviderOp::Create, "network", ProviderError::permanent("quota"), Some(1))
        .await;
    let engine = engine(&temp, &provider, STACK);

    let (_, first) = engine.run("it", Goal::Converge).await.unwrap();
    assert_eq!(first.outcome("n1").unwrap().status, NodeStatus::Failed);
    assert_eq!(first.outcome("i1").unwrap().status, NodeStatus::Skipped);
    assert_eq!(first.outcome("logs").unwrap().status, NodeStatus::Succeeded);
    assert!(provider.calls_for("instance").await.is_empty());

    let plan = engine.plan(Goal::Converge).await.unwrap();
    assert_eq!(
        plan.actions(),
        vec![
            ("logs", ChangeAction::NoOp),
            ("n1", ChangeAction::Create),
            ("i1", ChangeAction::Create),
        ]
    );

    let (_, second) = engine.run("it", Goal::Converge).await.unwrap();
    assert!(second.succeeded());
}

#[tokio::test]
async fn test_removed_resources_are_deleted_and_destroy_empties_state() {
    let temp = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    engine(&temp, &provider, STACK).run("it", Goal::Converge).await.unwrap();

    let smaller = StackSpec::new("shop", "test").with_resource(ResourceSpec::new("logs", "bucket"));
    let engine = Engine::new(
        smaller,
        Arc::new(LocalStateStore::with_base_dir(temp.path())),
        provider.clone(),
    )
    .unwrap();
    let (plan, result) = engine.run("it", Goal::Converge).await.unwrap();
    assert_eq!(
        plan.actions(),
        vec![
            ("logs", ChangeAction::NoOp),
            ("i1", ChangeAction::Delete),
            ("n1", ChangeAction::Delete),
        ]
    );
    assert!(result.succeeded());

    let (_, destroyed) = engine.run("it", Goal::Destroy).await.unwrap();
    assert!(destroyed.succeeded());
    assert!(engine.store().load().await.unwrap().is_empty());
    assert!(provider.resources().await.is_empty());
}

#[tokio::test]
async fn test_demo_stack_applies_in_dependency_order() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/halyard.stack.yaml");
    let stack = ConfigParser::new().load_file(&path).unwrap();
    halyard::config::ConfigValidator::new().validate(&stack).unwrap();

    let temp = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let engine = Engine::new(
        stack,
        Arc::new(LocalStateStore::with_base_dir(temp.path())),
        provider.clone(),
    )
    .unwrap();

    let (plan, result) = engine.run("it", Goal::Converge).await.unwrap();
    assert_eq!(plan.count(ChangeAction::Create), 12);
    assert!(result.succeeded());

    let calls = provider.calls().await;
    let created = |id: &str| result.deltas.iter().position(|d| d.id() == id).unwrap();
    assert!(created("vpc") < created("public"));
    assert!(created("private-route") < created("app"));
    assert!(created("app") < created("release"));
    assert_eq!(calls.len(), 12);
}

#[tokio::test]
async fn test_lost_lock_cancels_running_apply() {
    let temp = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(200)));
    let engine = engine(&temp, &provider, STACK).with_lock_refresh(Duration::from_millis(20));

    let pending = engine.prepare("slow", Goal::Converge).await.unwrap();
    let lock_path = temp.path().join("state.lock");
    let intruder = LockInfo::new("intruder");
    let takeover = {
        let intruder = intruder.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::write(&lock_path, serde_json::to_string(&intruder).unwrap()).unwrap();
        })
    };

    let result = engine.execute(pending).await;
    takeover.await.unwrap();

    assert_eq!(result.outcome("n1").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(result.outcome("logs").unwrap().status, NodeStatus::Succeeded);
    assert_eq!(result.outcome("i1").unwrap().status, NodeStatus::Skipped);
    assert!(provider.calls_for("instance").await.is_empty());

    // The run never deletes a lock it no longer owns.
    let store = LocalStateStore::with_base_dir(temp.path());
    assert_eq!(store.get_lock_info().await.unwrap(), Some(intruder));
}

#[tokio::test]
async fn test_refreshed_lock_outlives_its_first_expiry() {
    let temp = TempDir::new().unwrap();
    let provider = Arc::new(MemoryProvider::new().with_latency(Duration::from_millis(100)));
    let engine = engine(&temp, &provider, STACK).with_lock_refresh(Duration::from_millis(20));

    let pending = engine.prepare("slow", Goal::Converge).await.unwrap();
    let store = LocalStateStore::with_base_dir(temp.path());
    let acquired = store.get_lock_info().await.unwrap().unwrap();

    let watcher = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        store.get_lock_info().await.unwrap()
    });
    let result = engine.execute(pending).await;
    assert!(result.succeeded());

    let during = watcher.await.unwrap().unwrap();
    assert_eq!(during.lock_id, acquired.lock_id);
    assert!(during.expires_at > acquired.expires_at);
    assert!(!engine.store().is_locked().await.unwrap());
}
