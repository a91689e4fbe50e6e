//! Task lifecycle manager — the stateful façade over the store.
//!
//! Owns the in-memory task cache and the current-task pointer (single owning
//! context; both are reconciled by id and may be stale relative to the store),
//! applies status transitions, accumulates usage metrics as messages arrive,
//! manages checkpoints, and fans out batch operations with per-item
//! partial-failure reporting. Every mutation emits a lifecycle event after the
//! store write succeeds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, TaskError};
use crate::events::{EventBus, TaskEvent};
use crate::model::{
    new_id, now_ms, Checkpoint, ExportFormat, Message, SortKey, SortOrder, Task, TaskDraft,
    TaskFilters, TaskMetadata, TaskPatch, TaskStats, TaskStatus,
};
use crate::observability::LatencyTracker;
use crate::store::TaskStore;

const DEFAULT_SEARCH_LIMIT: i64 = 50;

// ─── Batch results ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub id: String,
    pub error: String,
}

/// Full partition of a batch call: `succeeded` + `failed` always sum to the
/// input length. One id's failure never blocks another's success.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchExportEntry {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchExportOutcome {
    pub succeeded: Vec<BatchExportEntry>,
    pub failed: Vec<BatchFailure>,
}

fn partition<T>(results: Vec<(String, std::result::Result<T, String>)>) -> (Vec<(String, T)>, Vec<BatchFailure>) {
    let mut ok = Vec::new();
    let mut failed = Vec::new();
    for (id, result) in results {
        match result {
            Ok(value) => ok.push((id, value)),
            Err(error) => failed.push(BatchFailure { id, error }),
        }
    }
    (ok, failed)
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct TaskManager {
    store: TaskStore,
    events: EventBus<TaskEvent>,
    /// In-memory cache, reconciled by id.
    tasks: RwLock<HashMap<String, Task>>,
    /// Id of the current task, if any.
    current: RwLock<Option<String>>,
    initialized: AtomicBool,
}

impl TaskManager {
    pub fn new(store: TaskStore) -> Self {
        Self {
            store,
            events: EventBus::default(),
            tasks: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    /// Restore the most recently updated active task (if any) as current and
    /// start accepting operations. Every other call fails `NotInitialized`
    /// until this completes.
    pub async fn initialize(&self) -> Result<()> {
        let active = self
            .store
            .list(&TaskFilters {
                status: Some(TaskStatus::Active),
                limit: Some(1),
                sort_by: SortKey::UpdatedAt,
                sort_order: SortOrder::Desc,
                ..Default::default()
            })
            .await?;

        if let Some(task) = active.into_iter().next() {
            info!(id = %task.id, "restored active task");
            self.cache_put(&task).await;
            *self.current.write().await = Some(task.id.clone());
            self.events.emit(TaskEvent::TaskLoaded(task));
        }

        self.initialized.store(true, Ordering::SeqCst);
        self.events.emit(TaskEvent::Ready);
        info!("task manager initialized");
        Ok(())
    }

    /// Stop accepting operations, drop cached state, and close the store.
    pub async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.tasks.write().await.clear();
        *self.current.write().await = None;
        self.store.close().await;
        self.events.emit(TaskEvent::Closed);
        info!("task manager closed");
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    fn ensure_initialized(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(TaskError::NotInitialized);
        }
        Ok(())
    }

    async fn cache_put(&self, task: &Task) {
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), task.clone());
    }

    // ─── CRUD ────────────────────────────────────────────────────────────────

    /// Create a task and make it current.
    pub async fn create_task(&self, text: Option<&str>, mode: Option<&str>) -> Result<Task> {
        self.ensure_initialized()?;

        let metadata = TaskMetadata {
            mode: mode.unwrap_or("agent").to_string(),
            ..Default::default()
        };
        let task = self
            .store
            .create(TaskDraft {
                text: text.map(str::to_string),
                metadata: Some(metadata),
                ..Default::default()
            })
            .await?;

        self.cache_put(&task).await;
        *self.current.write().await = Some(task.id.clone());
        self.events.emit(TaskEvent::TaskCreated(task.clone()));
        info!(id = %task.id, "task created");
        Ok(task)
    }

    /// Get a task by id without touching the current pointer. Cache-first.
    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.ensure_initialized()?;

        if let Some(task) = self.tasks.read().await.get(id) {
            return Ok(task.clone());
        }
        let task = self.store.get(id).await?;
        self.cache_put(&task).await;
        Ok(task)
    }

    /// Get a task by id and make it current.
    pub async fn load_task(&self, id: &str) -> Result<Task> {
        let task = self.get_task(id).await?;
        *self.current.write().await = Some(task.id.clone());
        self.events.emit(TaskEvent::TaskLoaded(task.clone()));
        Ok(task)
    }

    /// The current task, if one is set and still cached.
    pub async fn current_task(&self) -> Option<Task> {
        let id = self.current.read().await.clone()?;
        self.tasks.read().await.get(&id).cloned()
    }

    /// Apply a partial update, reconcile the cache, and emit `TaskUpdated`.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.ensure_initialized()?;

        let task = self.store.update(id, patch).await?;
        self.cache_put(&task).await;
        self.events.emit(TaskEvent::TaskUpdated(task.clone()));
        Ok(task)
    }

    /// Delete a task, evicting it from the cache and the current pointer.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        self.ensure_initialized()?;

        let deleted = self.store.delete(id).await?;
        if deleted {
            self.tasks.write().await.remove(id);
            let mut current = self.current.write().await;
            if current.as_deref() == Some(id) {
                *current = None;
            }
            drop(current);
            self.events.emit(TaskEvent::TaskDeleted(id.to_string()));
            info!(id = %id, "task deleted");
        }
        Ok(deleted)
    }

    // ─── Messages & metrics ──────────────────────────────────────────────────

    /// Append a message. A metrics fragment on the message is summed into the
    /// accumulated counters (never overwritten) and `context_tokens` is
    /// re-derived.
    pub async fn add_message(&self, id: &str, message: Message) -> Result<Task> {
        self.ensure_initialized()?;

        let mut task = self.store.get(id).await?;
        if let Some(fragment) = &message.api_metrics {
            task.api_metrics.absorb(fragment);
        }
        task.messages.push(message);

        self.update_task(
            id,
            TaskPatch {
                messages: Some(task.messages),
                api_metrics: Some(task.api_metrics),
                ..Default::default()
            },
        )
        .await
    }

    // ─── Status transitions ──────────────────────────────────────────────────

    /// Apply a status transition. Terminal transitions stamp `completed_at`
    /// exactly once; resuming back to `active` keeps it as history. Emits a
    /// generic `TaskUpdated` plus the status-specific event.
    pub async fn set_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        self.transition(id, status, None, None).await
    }

    pub async fn complete_task(&self, id: &str) -> Result<Task> {
        self.set_status(id, TaskStatus::Completed).await
    }

    /// Terminate a task, recording the reason.
    pub async fn terminate_task(&self, id: &str, reason: Option<&str>) -> Result<Task> {
        self.transition(id, TaskStatus::Terminated, reason, None)
            .await
    }

    /// Fail a task. The error is required and always recorded.
    pub async fn fail_task(&self, id: &str, error: &str, stack: Option<&str>) -> Result<Task> {
        self.transition(id, TaskStatus::Failed, Some(error), stack)
            .await
    }

    /// Resume a terminal task back to `active` and make it current.
    /// `completed_at` and error metadata are preserved as history.
    pub async fn resume_task(&self, id: &str) -> Result<Task> {
        let task = self.set_status(id, TaskStatus::Active).await?;
        *self.current.write().await = Some(task.id.clone());
        Ok(task)
    }

    async fn transition(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
        stack: Option<&str>,
    ) -> Result<Task> {
        self.ensure_initialized()?;

        let existing = self.store.get(id).await?;
        let mut patch = TaskPatch {
            status: Some(status),
            ..Default::default()
        };
        if status.is_terminal() && existing.completed_at.is_none() {
            patch.completed_at = Some(now_ms());
        }
        if error.is_some() || stack.is_some() {
            let mut metadata = existing.metadata.clone();
            if let Some(error) = error {
                metadata.error = Some(error.to_string());
            }
            if let Some(stack) = stack {
                metadata.stack = Some(stack.to_string());
            }
            patch.metadata = Some(metadata);
        }

        let task = self.store.update(id, patch).await?;
        self.cache_put(&task).await;
        self.events.emit(TaskEvent::TaskUpdated(task.clone()));

        match status {
            TaskStatus::Completed => self.events.emit(TaskEvent::TaskCompleted(task.clone())),
            TaskStatus::Terminated => self.events.emit(TaskEvent::TaskTerminated(task.clone())),
            TaskStatus::Failed => self.events.emit(TaskEvent::TaskFailed {
                task: task.clone(),
                error: task
                    .metadata
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            }),
            TaskStatus::Active => {}
        }

        debug!(id = %id, status = %status, "status transition");
        Ok(task)
    }

    // ─── Checkpoints ─────────────────────────────────────────────────────────

    /// Snapshot the current message count and context usage as a checkpoint
    /// and make it the current one.
    pub async fn add_checkpoint(&self, id: &str, label: Option<&str>) -> Result<Task> {
        self.ensure_initialized()?;

        let mut task = self.store.get(id).await?;
        let checkpoint = Checkpoint {
            id: new_id(),
            timestamp: now_ms(),
            message_index: task.messages.len(),
            context_tokens: task.context_tokens,
            label: label.map(str::to_string),
        };
        let checkpoint_id = checkpoint.id.clone();
        task.checkpoints.push(checkpoint);

        let task = self
            .update_task(
                id,
                TaskPatch {
                    checkpoints: Some(task.checkpoints),
                    current_checkpoint: Some(checkpoint_id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        self.events.emit(TaskEvent::CheckpointAdded {
            task: task.clone(),
            checkpoint_id,
        });
        Ok(task)
    }

    /// Roll the task back to a checkpoint, truncating messages recorded after
    /// it. Discarded messages are gone for good.
    pub async fn restore_checkpoint(&self, id: &str, checkpoint_id: &str) -> Result<Task> {
        self.ensure_initialized()?;

        let mut task = self.store.get(id).await?;
        let checkpoint = task
            .checkpoints
            .iter()
            .find(|c| c.id == checkpoint_id)
            .cloned()
            .ok_or_else(|| TaskError::CheckpointNotFound {
                task_id: id.to_string(),
                checkpoint_id: checkpoint_id.to_string(),
            })?;

        task.messages.truncate(checkpoint.message_index);
        let task = self
            .update_task(
                id,
                TaskPatch {
                    messages: Some(task.messages),
                    current_checkpoint: Some(checkpoint.id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        info!(id = %id, checkpoint = %checkpoint_id, "checkpoint restored");
        self.events.emit(TaskEvent::CheckpointRestored {
            task: task.clone(),
            checkpoint_id: checkpoint.id,
        });
        Ok(task)
    }

    // ─── Listing & export ────────────────────────────────────────────────────

    pub async fn list_tasks(&self, filters: &TaskFilters) -> Result<Vec<Task>> {
        self.ensure_initialized()?;
        self.store.list(filters).await
    }

    /// Free-text search, most recently updated first.
    pub async fn search_tasks(&self, query: &str, limit: Option<i64>) -> Result<Vec<Task>> {
        self.ensure_initialized()?;
        self.store
            .list(&TaskFilters {
                search: Some(query.to_string()),
                limit: Some(limit.unwrap_or(DEFAULT_SEARCH_LIMIT)),
                sort_by: SortKey::UpdatedAt,
                sort_order: SortOrder::Desc,
                ..Default::default()
            })
            .await
    }

    pub async fn stats(&self) -> Result<TaskStats> {
        self.ensure_initialized()?;
        self.store.stats().await
    }

    pub async fn export_task(&self, id: &str, format: ExportFormat) -> Result<String> {
        self.ensure_initialized()?;
        self.store.export(id, format).await
    }

    // ─── Batch operations ────────────────────────────────────────────────────
    //
    // Every id is attempted independently and concurrently; per-item failures
    // are folded into the outcome instead of propagating, so a bad id never
    // poisons the rest of the batch.

    pub async fn batch_set_status(
        &self,
        ids: &[String],
        status: TaskStatus,
    ) -> Result<BatchOutcome> {
        self.ensure_initialized()?;
        let tracker = LatencyTracker::start("task.batchSetStatus");

        let results = join_all(ids.iter().map(|id| async move {
            let result = self.set_status(id, status).await;
            (id.clone(), result.map(|_| ()).map_err(|e| e.to_string()))
        }))
        .await;

        let (ok, failed) = partition(results);
        tracker.finish();
        Ok(BatchOutcome {
            succeeded: ok.into_iter().map(|(id, _)| id).collect(),
            failed,
        })
    }

    pub async fn batch_delete(&self, ids: &[String]) -> Result<BatchOutcome> {
        self.ensure_initialized()?;
        let tracker = LatencyTracker::start("task.batchDelete");

        let results = join_all(ids.iter().map(|id| async move {
            let result = match self.delete_task(id).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(TaskError::NotFound(id.clone()).to_string()),
                Err(e) => Err(e.to_string()),
            };
            (id.clone(), result)
        }))
        .await;

        let (ok, failed) = partition(results);
        tracker.finish();
        Ok(BatchOutcome {
            succeeded: ok.into_iter().map(|(id, _)| id).collect(),
            failed,
        })
    }

    pub async fn batch_export(
        &self,
        ids: &[String],
        format: ExportFormat,
    ) -> Result<BatchExportOutcome> {
        self.ensure_initialized()?;
        let tracker = LatencyTracker::start("task.batchExport");

        let results = join_all(ids.iter().map(|id| async move {
            let result = self.store.export(id, format).await.map_err(|e| e.to_string());
            (id.clone(), result)
        }))
        .await;

        let (ok, failed) = partition(results);
        tracker.finish();
        Ok(BatchExportOutcome {
            succeeded: ok
                .into_iter()
                .map(|(id, data)| BatchExportEntry { id, data })
                .collect(),
            failed,
        })
    }

    /// Merge-dedupe tags onto each task, preserving existing order.
    pub async fn batch_add_tags(&self, ids: &[String], tags: &[String]) -> Result<BatchOutcome> {
        self.ensure_initialized()?;
        let tracker = LatencyTracker::start("task.batchAddTags");

        let results = join_all(ids.iter().map(|id| async move {
            let result = async {
                let task = self.store.get(id).await?;
                let mut metadata = task.metadata.clone();
                for tag in tags {
                    if !metadata.tags.contains(tag) {
                        metadata.tags.push(tag.clone());
                    }
                }
                self.update_task(
                    id,
                    TaskPatch {
                        metadata: Some(metadata),
                        ..Default::default()
                    },
                )
                .await?;
                Ok::<_, TaskError>(())
            }
            .await;
            (id.clone(), result.map_err(|e| e.to_string()))
        }))
        .await;

        let (ok, failed) = partition(results);
        tracker.finish();
        Ok(BatchOutcome {
            succeeded: ok.into_iter().map(|(id, _)| id).collect(),
            failed,
        })
    }

    /// Filter the given tags out of each task.
    pub async fn batch_remove_tags(&self, ids: &[String], tags: &[String]) -> Result<BatchOutcome> {
        self.ensure_initialized()?;
        let tracker = LatencyTracker::start("task.batchRemoveTags");

        let results = join_all(ids.iter().map(|id| async move {
            let result = async {
                let task = self.store.get(id).await?;
                let mut metadata = task.metadata.clone();
                metadata.tags.retain(|tag| !tags.contains(tag));
                self.update_task(
                    id,
                    TaskPatch {
                        metadata: Some(metadata),
                        ..Default::default()
                    },
                )
                .await?;
                Ok::<_, TaskError>(())
            }
            .await;
            (id.clone(), result.map_err(|e| e.to_string()))
        }))
        .await;

        let (ok, failed) = partition(results);
        tracker.finish();
        Ok(BatchOutcome {
            succeeded: ok.into_iter().map(|(id, _)| id).collect(),
            failed,
        })
    }
}
