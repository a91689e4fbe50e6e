//! Integration tests for the subtask orchestrator: stack discipline, depth
//! limits, pause-on-spawn / resume-on-complete, and deferred result tickets.

use std::sync::Arc;

use serde_json::json;
use taskstack::model::{Message, PauseReason, TaskStatus};
use taskstack::{OrchestratorConfig, SubtaskOrchestrator, TaskError, TaskManager, TaskStore};
use tempfile::TempDir;

async fn make_orchestrator(dir: &TempDir, config: OrchestratorConfig) -> Arc<SubtaskOrchestrator> {
    let store = TaskStore::open(dir.path()).await.expect("store open failed");
    let manager = Arc::new(TaskManager::new(store));
    manager.initialize().await.expect("initialize failed");
    Arc::new(SubtaskOrchestrator::new(manager, config, dir.path()))
}

#[tokio::test]
async fn root_task_starts_at_depth_zero() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    let root = orch.start_root_task(Some("root work"), None).await.unwrap();
    assert_eq!(root.relationship.depth, 0);
    assert!(root.relationship.parent_task_id.is_none());

    let stack = orch.stack().await;
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].task_id, root.task.id);

    let current = orch.current_task().await.unwrap().unwrap();
    assert_eq!(current.task.id, root.task.id);
}

#[tokio::test]
async fn subtask_requires_an_active_task() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    let err = orch.start_subtask(Some("orphan"), None).await.unwrap_err();
    assert!(matches!(err, TaskError::NoActiveTask));
}

#[tokio::test]
async fn starting_a_subtask_pauses_parent_and_pushes_child() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    let root = orch.start_root_task(Some("parent"), None).await.unwrap();
    orch.add_message(Message::say("parent context"))
        .await
        .unwrap();

    let ticket = orch.start_subtask(Some("child"), None).await.unwrap();
    let child = ticket.task().clone();

    assert_eq!(child.relationship.depth, 1);
    assert_eq!(
        child.relationship.parent_task_id.as_deref(),
        Some(root.task.id.as_str())
    );

    let stack = orch.stack().await;
    assert_eq!(stack.len(), 2);
    assert_eq!(stack[1].task_id, child.task.id);

    // Parent is paused waiting for the subtask, with its message count
    // recorded at pause time.
    let parent_frame = &stack[0];
    let pause = parent_frame.pause_state.as_ref().expect("parent not paused");
    assert_eq!(pause.reason, PauseReason::WaitingForSubtask);
    assert_eq!(pause.message_index_at_pause, 1);
    assert!(pause.resumable);

    // Parent's child list links the new task.
    assert_eq!(
        parent_frame.relationship.child_task_ids,
        vec![child.task.id.clone()]
    );
}

#[tokio::test]
async fn completing_a_subtask_resumes_parent_and_resolves_waiter() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    let root = orch.start_root_task(Some("parent"), None).await.unwrap();
    let ticket = orch.start_subtask(Some("child"), None).await.unwrap();
    let child_id = ticket.task().task.id.clone();

    orch.add_message(Message::say("child output")).await.unwrap();

    let waiter = tokio::spawn(ticket.wait());
    orch.complete_subtask(Some(json!({"ok": true})))
        .await
        .unwrap();

    let result = waiter.await.unwrap().unwrap();
    assert_eq!(result.task_id, child_id);
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.result, Some(json!({"ok": true})));
    assert_eq!(result.messages.len(), 1);

    // Parent is back on top, unpaused, and current again.
    let stack = orch.stack().await;
    assert_eq!(stack.len(), 1);
    assert_eq!(stack[0].task_id, root.task.id);
    assert!(stack[0].pause_state.is_none());

    let current = orch.current_task().await.unwrap().unwrap();
    assert_eq!(current.task.id, root.task.id);
    let manager_current = orch.manager().current_task().await.unwrap();
    assert_eq!(manager_current.id, root.task.id);

    // The child task is durably completed.
    let child = orch.manager().get_task(&child_id).await.unwrap();
    assert_eq!(child.status, TaskStatus::Completed);
    assert!(child.completed_at.is_some());
}

#[tokio::test]
async fn failing_a_subtask_rejects_the_waiter() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    orch.start_root_task(Some("parent"), None).await.unwrap();
    let ticket = orch.start_subtask(Some("child"), None).await.unwrap();
    let child_id = ticket.task().task.id.clone();

    let waiter = tokio::spawn(ticket.wait());
    orch.fail_subtask("tool crashed").await.unwrap();

    let err = waiter.await.unwrap().unwrap_err();
    match err {
        TaskError::SubtaskFailed { task_id, message } => {
            assert_eq!(task_id, child_id);
            assert!(message.contains("tool crashed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let child = orch.manager().get_task(&child_id).await.unwrap();
    assert_eq!(child.status, TaskStatus::Failed);
    assert_eq!(child.metadata.error.as_deref(), Some("tool crashed"));

    // Parent resumed despite the failure.
    let stack = orch.stack().await;
    assert_eq!(stack.len(), 1);
    assert!(stack[0].pause_state.is_none());
}

#[tokio::test]
async fn fourth_level_subtask_exceeds_default_depth() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    orch.start_root_task(Some("depth 0"), None).await.unwrap();
    let _t1 = orch.start_subtask(Some("depth 1"), None).await.unwrap();
    let _t2 = orch.start_subtask(Some("depth 2"), None).await.unwrap();
    let _t3 = orch.start_subtask(Some("depth 3"), None).await.unwrap();

    let err = orch.start_subtask(Some("depth 4"), None).await.unwrap_err();
    assert!(matches!(
        err,
        TaskError::MaxDepthExceeded { depth: 4, max: 3 }
    ));
}

#[tokio::test]
async fn parentless_completion_is_terminal_and_unobserved() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    let root = orch.start_root_task(Some("solo"), None).await.unwrap();
    let result = orch.complete_subtask(None).await.unwrap();

    assert_eq!(result.task_id, root.task.id);
    assert!(orch.stack().await.is_empty());
    assert!(orch.current_task().await.unwrap().is_none());
}

#[tokio::test]
async fn explicit_pause_and_resume() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    let root = orch.start_root_task(Some("pausable"), None).await.unwrap();
    orch.pause_task(&root.task.id, PauseReason::UserRequest)
        .await
        .unwrap();

    let stack = orch.stack().await;
    let pause = stack[0].pause_state.as_ref().expect("not paused");
    assert_eq!(pause.reason, PauseReason::UserRequest);

    orch.resume_task(&root.task.id).await.unwrap();
    assert!(orch.stack().await[0].pause_state.is_none());
}

#[tokio::test]
async fn pause_gate_respects_config() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(
        &dir,
        OrchestratorConfig {
            enable_pause_resume: false,
            ..Default::default()
        },
    )
    .await;

    let root = orch.start_root_task(Some("ungated"), None).await.unwrap();
    orch.pause_task(&root.task.id, PauseReason::UserRequest)
        .await
        .unwrap();
    // Explicit pause is a no-op when disabled...
    assert!(orch.stack().await[0].pause_state.is_none());

    // ...but subtask-driven pause still applies.
    let _ticket = orch.start_subtask(Some("child"), None).await.unwrap();
    let stack = orch.stack().await;
    assert!(stack[0].pause_state.is_some());
}

#[tokio::test]
async fn depth_and_family_accessors() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    let root = orch.start_root_task(Some("parent"), None).await.unwrap();
    let ticket = orch.start_subtask(Some("child"), None).await.unwrap();
    let child_id = ticket.task().task.id.clone();

    assert_eq!(orch.task_depth(&root.task.id).await, Some(0));
    assert_eq!(orch.task_depth(&child_id).await, Some(1));
    assert_eq!(orch.task_depth("stranger").await, None);

    let parent = orch.parent_task(&child_id).await.unwrap().unwrap();
    assert_eq!(parent.task.id, root.task.id);
    assert!(orch.parent_task(&root.task.id).await.unwrap().is_none());

    let children = orch.child_tasks(&root.task.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].task.id, child_id);
    assert_eq!(children[0].relationship.sibling_index, 0);
}

#[tokio::test]
async fn sequential_siblings_get_increasing_sibling_index() {
    let dir = TempDir::new().unwrap();
    let orch = make_orchestrator(&dir, OrchestratorConfig::default()).await;

    orch.start_root_task(Some("parent"), None).await.unwrap();

    let first = orch.start_subtask(Some("first child"), None).await.unwrap();
    assert_eq!(first.task().relationship.sibling_index, 0);
    orch.complete_subtask(None).await.unwrap();

    let second = orch.start_subtask(Some("second child"), None).await.unwrap();
    assert_eq!(second.task().relationship.sibling_index, 1);
}
