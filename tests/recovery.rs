//! Integration tests for stack snapshot and restart replay. These simulate a
//! process restart by building a second manager/orchestrator over the same
//! data directory.

use std::sync::Arc;
use std::time::Duration;

use taskstack::model::PauseReason;
use taskstack::{OrchestratorConfig, SubtaskOrchestrator, TaskManager, TaskStore};
use tempfile::TempDir;

async fn make_orchestrator(dir: &TempDir, config: OrchestratorConfig) -> Arc<SubtaskOrchestrator> {
    let store = TaskStore::open(dir.path()).await.expect("store open failed");
    let manager = Arc::new(TaskManager::new(store));
    manager.initialize().await.expect("initialize failed");
    Arc::new(SubtaskOrchestrator::new(manager, config, dir.path()))
}

#[tokio::test]
async fn snapshot_replay_rebuilds_stack_and_recurrents_top() {
    let dir = TempDir::new().unwrap();

    // 1. Build a two-deep stack and snapshot it.
    let (root_id, child_id) = {
        let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;
        let root = orch.start_root_task(Some("long running"), None).await.unwrap();
        let ticket = orch.start_subtask(Some("sub work"), None).await.unwrap();
        let child_id = ticket.task().task.id.clone();
        orch.snapshot_now().await.unwrap();
        (root.task.id.clone(), child_id)
    };

    // 2. Simulate restart: fresh manager + orchestrator over the same dir.
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;
    let restored = orch.restore().await.unwrap();
    assert_eq!(restored, 2);

    let stack = orch.stack().await;
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[0].task_id, root_id);
    assert_eq!(stack[1].task_id, child_id);

    // Relationship and pause metadata came back with the frames.
    assert_eq!(stack[0].relationship.child_task_ids, vec![child_id.clone()]);
    let pause = stack[0].pause_state.as_ref().expect("parent pause lost");
    assert_eq!(pause.reason, PauseReason::WaitingForSubtask);
    assert_eq!(stack[1].relationship.depth, 1);

    // The restored top of stack is current again.
    let current = orch.current_task().await.unwrap().unwrap();
    assert_eq!(current.task.id, child_id);
    let manager_current = orch.manager().current_task().await.unwrap();
    assert_eq!(manager_current.id, child_id);
}

#[tokio::test]
async fn restore_silently_drops_ids_missing_from_the_store() {
    let dir = TempDir::new().unwrap();

    let (root_id, child_id) = {
        let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;
        let root = orch.start_root_task(Some("survivor"), None).await.unwrap();
        let ticket = orch.start_subtask(Some("doomed"), None).await.unwrap();
        let child_id = ticket.task().task.id.clone();
        orch.snapshot_now().await.unwrap();
        // Delete the child behind the snapshot's back.
        orch.manager().delete_task(&child_id).await.unwrap();
        (root.task.id.clone(), child_id)
    };

    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;
    let restored = orch.restore().await.unwrap();
    assert_eq!(restored, 1);

    let stack = orch.stack().await;
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].task_id, root_id);
    assert_ne!(stack[0].task_id, child_id);

    // The surviving top becomes current.
    let current = orch.current_task().await.unwrap().unwrap();
    assert_eq!(current.task.id, root_id);
}

#[tokio::test]
async fn bootstrap_wires_config_through_every_layer() {
    let dir = TempDir::new().unwrap();
    let config = taskstack::EngineConfig {
        data_dir: dir.path().to_path_buf(),
        orchestrator: OrchestratorConfig {
            max_depth: 1,
            ..Default::default()
        },
        ..Default::default()
    };

    let (manager, orch) = taskstack::bootstrap(&config).await.unwrap();
    assert_eq!(orch.config().max_depth, 1);

    orch.start_root_task(Some("configured"), None).await.unwrap();
    let _child = orch.start_subtask(Some("depth 1"), None).await.unwrap();
    let err = orch.start_subtask(Some("depth 2"), None).await.unwrap_err();
    assert!(matches!(err, taskstack::TaskError::MaxDepthExceeded { .. }));

    assert_eq!(manager.stats().await.unwrap().total, 2);
}

#[tokio::test]
async fn restore_with_no_snapshot_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    let restored = orch.restore().await.unwrap();
    assert_eq!(restored, 0);
    assert!(orch.stack().await.is_empty());
}

#[tokio::test]
async fn autosave_writes_snapshots_on_the_configured_interval() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(
        &dir,
        OrchestratorConfig {
            snapshot_interval_secs: 1,
            ..Default::default()
        },
    )
    .await;

    orch.start_root_task(Some("autosaved"), None).await.unwrap();
    orch.start_autosave().await;

    let snapshot_path = dir.path().join("task_stack.json");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(snapshot_path.exists(), "autosave never wrote a snapshot");

    orch.shutdown().await.unwrap();

    // Shutdown leaves a final snapshot behind that a restart can replay.
    let orch2 = make_orchestrator(&dir, OrchestratorConfig::default()).await;
    assert_eq!(orch2.restore().await.unwrap(), 1);
}
