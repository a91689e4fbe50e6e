//! Subtask orchestrator — hierarchical task decomposition on top of the
//! lifecycle manager.
//!
//! An explicit LIFO stack tracks in-flight tasks; the top of the stack is the
//! current task. Starting a subtask pauses its parent and returns a ticket
//! whose `wait()` resolves when the child completes. Waiters are correlated by
//! task id through per-id one-shot channels, which stays correct once
//! concurrent subtasks are scheduled.
//!
//! The stack is snapshotted to a JSON file on a fixed interval (call
//! `start_autosave` after wrapping the orchestrator in an `Arc`) and replayed
//! with `restore()` after a restart.

pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{Result, TaskError};
use crate::events::{EventBus, OrchestratorEvent};
use crate::manager::TaskManager;
use crate::model::{
    now_ms, Message, PauseReason, StackedTask, SubtaskRelationship, SubtaskResult, Task,
    TaskPauseState,
};
use snapshot::{SnapshotEntry, SnapshotStore};

/// One in-flight task on the stack, with the orchestration metadata the task
/// store does not own.
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub task_id: String,
    pub started_at: i64,
    pub paused_at: Option<i64>,
    pub relationship: SubtaskRelationship,
    pub pause_state: Option<TaskPauseState>,
}

#[derive(Default)]
struct StackState {
    stack: Vec<StackFrame>,
    /// Deferred subtask waiters, keyed by child task id. Narrowly scoped
    /// one-shot handlers rather than a type-wide listener.
    waiters: HashMap<String, oneshot::Sender<std::result::Result<SubtaskResult, String>>>,
}

impl StackState {
    fn frame_mut(&mut self, task_id: &str) -> Option<&mut StackFrame> {
        self.stack.iter_mut().find(|f| f.task_id == task_id)
    }

    fn frame(&self, task_id: &str) -> Option<&StackFrame> {
        self.stack.iter().find(|f| f.task_id == task_id)
    }
}

/// Deferred result of a running subtask. `wait()` suspends until the child
/// reaches a terminal state — indefinitely, with no built-in timeout.
#[derive(Debug)]
pub struct SubtaskTicket {
    task: StackedTask,
    rx: oneshot::Receiver<std::result::Result<SubtaskResult, String>>,
}

impl SubtaskTicket {
    /// The child task as it was spawned.
    pub fn task(&self) -> &StackedTask {
        &self.task
    }

    pub async fn wait(self) -> Result<SubtaskResult> {
        let task_id = self.task.task.id.clone();
        match self.rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(TaskError::SubtaskFailed { task_id, message }),
            Err(_) => Err(TaskError::SubtaskFailed {
                task_id,
                message: "orchestrator dropped before completion".to_string(),
            }),
        }
    }
}

pub struct SubtaskOrchestrator {
    manager: Arc<TaskManager>,
    config: OrchestratorConfig,
    state: RwLock<StackState>,
    events: EventBus<OrchestratorEvent>,
    snapshots: SnapshotStore,
    autosave: Mutex<Option<JoinHandle<()>>>,
}

impl SubtaskOrchestrator {
    pub fn new(
        manager: Arc<TaskManager>,
        config: OrchestratorConfig,
        data_dir: &std::path::Path,
    ) -> Self {
        Self {
            manager,
            snapshots: SnapshotStore::new(data_dir),
            config,
            state: RwLock::new(StackState::default()),
            events: EventBus::default(),
            autosave: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<TaskManager> {
        &self.manager
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    // ─── Spawning ────────────────────────────────────────────────────────────

    /// Start a new root task at depth 0 and make it current.
    pub async fn start_root_task(
        &self,
        text: Option<&str>,
        mode: Option<&str>,
    ) -> Result<StackedTask> {
        let task = self.manager.create_task(text, mode).await?;
        let relationship = SubtaskRelationship::root();

        self.state.write().await.stack.push(StackFrame {
            task_id: task.id.clone(),
            started_at: now_ms(),
            paused_at: None,
            relationship: relationship.clone(),
            pause_state: None,
        });

        self.events.emit(OrchestratorEvent::TaskSpawned {
            task_id: task.id.clone(),
            spawned_from: "root".to_string(),
        });
        info!(id = %task.id, "root task started");

        Ok(StackedTask {
            task,
            relationship,
            pause_state: None,
        })
    }

    /// Start a subtask under the current task.
    ///
    /// Pauses the parent (`waiting-for-subtask`, recording its message count),
    /// creates and links the child, pushes it as current, and returns a ticket
    /// that resolves when the child completes.
    pub async fn start_subtask(
        &self,
        text: Option<&str>,
        mode: Option<&str>,
    ) -> Result<SubtaskTicket> {
        let (parent_id, parent_depth, sibling_index) = {
            let state = self.state.read().await;
            let top = state.stack.last().ok_or(TaskError::NoActiveTask)?;
            (
                top.task_id.clone(),
                top.relationship.depth,
                top.relationship.child_task_ids.len(),
            )
        };

        let depth = parent_depth + 1;
        if depth > self.config.max_depth {
            return Err(TaskError::MaxDepthExceeded {
                depth,
                max: self.config.max_depth,
            });
        }

        self.pause_frame(&parent_id, PauseReason::WaitingForSubtask)
            .await?;

        let child = self.manager.create_task(text, mode).await?;
        let relationship = SubtaskRelationship {
            parent_task_id: Some(parent_id.clone()),
            child_task_ids: Vec::new(),
            depth,
            sibling_index,
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.write().await;
            if let Some(parent) = state.frame_mut(&parent_id) {
                parent.relationship.child_task_ids.push(child.id.clone());
            }
            state.stack.push(StackFrame {
                task_id: child.id.clone(),
                started_at: now_ms(),
                paused_at: None,
                relationship: relationship.clone(),
                pause_state: None,
            });
            state.waiters.insert(child.id.clone(), tx);
        }

        self.events.emit(OrchestratorEvent::SubtaskStarted {
            task_id: child.id.clone(),
            parent_task_id: parent_id.clone(),
            depth,
        });
        info!(id = %child.id, parent = %parent_id, depth, "subtask started");

        Ok(SubtaskTicket {
            task: StackedTask {
                task: child,
                relationship,
                pause_state: None,
            },
            rx,
        })
    }

    // ─── Completion ──────────────────────────────────────────────────────────

    /// Complete the current task: mark it `completed`, pop it, and — when it
    /// has a parent — resume the parent, make it current again, and resolve
    /// the waiter. A parentless completion is terminal and unobserved.
    pub async fn complete_subtask(
        &self,
        result: Option<serde_json::Value>,
    ) -> Result<SubtaskResult> {
        let frame = {
            let state = self.state.read().await;
            state.stack.last().cloned().ok_or(TaskError::NoActiveTask)?
        };

        let task = self.manager.complete_task(&frame.task_id).await?;
        let subtask_result = SubtaskResult {
            task_id: task.id.clone(),
            status: task.status,
            result,
            messages: task.messages.clone(),
            file_changes: task.metadata.file_changes.clone(),
            api_metrics: task.api_metrics.clone(),
        };

        self.state.write().await.stack.pop();

        if let Some(parent_id) = frame.relationship.parent_task_id.clone() {
            self.resume_frame(&parent_id).await?;
            self.manager.load_task(&parent_id).await?;

            self.events.emit(OrchestratorEvent::SubtaskCompleted {
                task_id: frame.task_id.clone(),
                parent_task_id: parent_id.clone(),
            });

            let waiter = self.state.write().await.waiters.remove(&frame.task_id);
            if let Some(tx) = waiter {
                let _ = tx.send(Ok(subtask_result.clone()));
            }
        }

        info!(id = %frame.task_id, "subtask completed");
        Ok(subtask_result)
    }

    /// Fail the current task: mark it `failed` with the given error, pop it,
    /// resume the parent, and reject the waiter.
    pub async fn fail_subtask(&self, error: &str) -> Result<Task> {
        let frame = {
            let state = self.state.read().await;
            state.stack.last().cloned().ok_or(TaskError::NoActiveTask)?
        };

        let task = self.manager.fail_task(&frame.task_id, error, None).await?;
        self.state.write().await.stack.pop();

        if let Some(parent_id) = frame.relationship.parent_task_id.clone() {
            self.resume_frame(&parent_id).await?;
            self.manager.load_task(&parent_id).await?;

            self.events.emit(OrchestratorEvent::SubtaskFailed {
                task_id: frame.task_id.clone(),
                parent_task_id: parent_id,
                error: error.to_string(),
            });

            let waiter = self.state.write().await.waiters.remove(&frame.task_id);
            if let Some(tx) = waiter {
                let _ = tx.send(Err(error.to_string()));
            }
        }

        info!(id = %frame.task_id, error, "subtask failed");
        Ok(task)
    }

    // ─── Pause / resume ──────────────────────────────────────────────────────

    /// Explicitly pause a stacked task. Gated by `enable_pause_resume`;
    /// subtask-driven pauses bypass the gate.
    pub async fn pause_task(&self, task_id: &str, reason: PauseReason) -> Result<()> {
        if !self.config.enable_pause_resume {
            warn!(id = %task_id, "pause/resume disabled by config");
            return Ok(());
        }
        self.pause_frame(task_id, reason).await
    }

    /// Explicitly resume a paused task. Gated by `enable_pause_resume`.
    pub async fn resume_task(&self, task_id: &str) -> Result<()> {
        if !self.config.enable_pause_resume {
            warn!(id = %task_id, "pause/resume disabled by config");
            return Ok(());
        }
        self.resume_frame(task_id).await
    }

    async fn pause_frame(&self, task_id: &str, reason: PauseReason) -> Result<()> {
        let message_index = self.manager.get_task(task_id).await?.messages.len();
        let now = now_ms();
        {
            let mut state = self.state.write().await;
            let frame = state
                .frame_mut(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            frame.pause_state = Some(TaskPauseState {
                paused_at: now,
                reason,
                message_index_at_pause: message_index,
                resumable: true,
            });
            frame.paused_at = Some(now);
        }

        self.events.emit(OrchestratorEvent::TaskPaused {
            task_id: task_id.to_string(),
            reason,
        });
        info!(id = %task_id, reason = reason.as_str(), "task paused");
        Ok(())
    }

    async fn resume_frame(&self, task_id: &str) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let frame = state
                .frame_mut(task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
            if frame.pause_state.is_none() {
                warn!(id = %task_id, "task is not paused");
                return Ok(());
            }
            frame.pause_state = None;
            frame.paused_at = None;
        }

        self.events.emit(OrchestratorEvent::TaskResumed {
            task_id: task_id.to_string(),
        });
        debug!(id = %task_id, "task resumed");
        Ok(())
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    /// Snapshot of the stack, bottom first; the last entry is current.
    pub async fn stack(&self) -> Vec<StackFrame> {
        self.state.read().await.stack.clone()
    }

    /// The task on top of the stack, enriched with its orchestration view.
    pub async fn current_task(&self) -> Result<Option<StackedTask>> {
        let frame = {
            let state = self.state.read().await;
            match state.stack.last() {
                Some(frame) => frame.clone(),
                None => return Ok(None),
            }
        };
        let task = self.manager.get_task(&frame.task_id).await?;
        Ok(Some(StackedTask {
            task,
            relationship: frame.relationship,
            pause_state: frame.pause_state,
        }))
    }

    /// Nesting depth of a stacked task, `None` when it is not on the stack.
    pub async fn task_depth(&self, task_id: &str) -> Option<u32> {
        self.state
            .read()
            .await
            .frame(task_id)
            .map(|f| f.relationship.depth)
    }

    pub async fn parent_task(&self, task_id: &str) -> Result<Option<StackedTask>> {
        let parent_frame = {
            let state = self.state.read().await;
            let Some(frame) = state.frame(task_id) else {
                return Ok(None);
            };
            let Some(parent_id) = &frame.relationship.parent_task_id else {
                return Ok(None);
            };
            match state.frame(parent_id) {
                Some(parent) => parent.clone(),
                None => return Ok(None),
            }
        };

        let task = self.manager.get_task(&parent_frame.task_id).await?;
        Ok(Some(StackedTask {
            task,
            relationship: parent_frame.relationship,
            pause_state: parent_frame.pause_state,
        }))
    }

    /// Children of a stacked task that are themselves still on the stack.
    pub async fn child_tasks(&self, task_id: &str) -> Result<Vec<StackedTask>> {
        let child_frames: Vec<StackFrame> = {
            let state = self.state.read().await;
            let Some(frame) = state.frame(task_id) else {
                return Ok(Vec::new());
            };
            frame
                .relationship
                .child_task_ids
                .iter()
                .filter_map(|id| state.frame(id))
                .cloned()
                .collect()
        };

        let mut children = Vec::with_capacity(child_frames.len());
        for frame in child_frames {
            let task = self.manager.get_task(&frame.task_id).await?;
            children.push(StackedTask {
                task,
                relationship: frame.relationship,
                pause_state: frame.pause_state,
            });
        }
        Ok(children)
    }

    /// Append a message to the current task.
    pub async fn add_message(&self, message: Message) -> Result<Task> {
        let task_id = {
            let state = self.state.read().await;
            state
                .stack
                .last()
                .map(|f| f.task_id.clone())
                .ok_or(TaskError::NoActiveTask)?
        };
        self.manager.add_message(&task_id, message).await
    }

    // ─── Snapshot & recovery ─────────────────────────────────────────────────

    /// Write the full stack to the snapshot file now.
    pub async fn snapshot_now(&self) -> Result<()> {
        let entries: Vec<SnapshotEntry> = self
            .state
            .read()
            .await
            .stack
            .iter()
            .map(|frame| SnapshotEntry {
                task_id: frame.task_id.clone(),
                started_at: frame.started_at,
                paused_at: frame.paused_at,
                relationship: frame.relationship.clone(),
                pause_state: frame.pause_state.clone(),
            })
            .collect();
        self.snapshots.save(&entries).await
    }

    /// Rebuild the stack from the last snapshot. Each id is re-fetched through
    /// the manager; ids the store no longer has are silently dropped. The
    /// restored top of stack becomes the current task. Returns the number of
    /// frames restored.
    pub async fn restore(&self) -> Result<usize> {
        let entries = self.snapshots.load().await?;
        if entries.is_empty() {
            debug!("no saved task stack");
            return Ok(0);
        }

        let mut frames = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.manager.get_task(&entry.task_id).await {
                Ok(_) => frames.push(StackFrame {
                    task_id: entry.task_id,
                    started_at: entry.started_at,
                    paused_at: entry.paused_at,
                    relationship: entry.relationship,
                    pause_state: entry.pause_state,
                }),
                Err(TaskError::NotFound(_)) => {
                    debug!(id = %entry.task_id, "dropping stack entry for missing task");
                }
                Err(e) => return Err(e),
            }
        }

        let restored = frames.len();
        let top = frames.last().map(|f| f.task_id.clone());
        self.state.write().await.stack = frames;

        if let Some(top_id) = top {
            self.manager.load_task(&top_id).await?;
        }
        info!(count = restored, "task stack restored");
        Ok(restored)
    }

    /// Start the periodic snapshot task. Idempotent. The loop holds only a
    /// weak reference, so dropping the orchestrator stops it.
    pub async fn start_autosave(self: &Arc<Self>) {
        let mut slot = self.autosave.lock().await;
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.snapshot_interval_secs.max(1));
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = orchestrator.snapshot_now().await {
                    warn!(err = %e, "periodic stack snapshot failed");
                }
            }
        }));
    }

    /// Stop the autosave loop and take a final snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.autosave.lock().await.take() {
            handle.abort();
        }
        self.snapshot_now().await
    }
}
