//! taskstack — persistent task lifecycle and subtask orchestration engine.
//!
//! Three layers, leaves first:
//!
//! 1. [`store::TaskStore`] — durable record-keeping over SQLite: CRUD,
//!    filtered/paginated listing, full-text search (FTS5, kept synchronized
//!    by triggers), statistics, export.
//! 2. [`manager::TaskManager`] — the stateful façade: status transitions,
//!    metric accumulation, checkpoints, batch operations with per-item
//!    partial-failure reporting, lifecycle events.
//! 3. [`orchestrator::SubtaskOrchestrator`] — LIFO stack of in-flight tasks
//!    with bounded nesting, pause-on-spawn / resume-on-complete, deferred
//!    result tickets, and periodic snapshot/replay for crash recovery.
//!
//! Commands flow orchestrator → manager → store; events flow back out through
//! the broadcast buses in [`events`].

pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod store;

use std::sync::Arc;

pub use config::{EngineConfig, OrchestratorConfig};
pub use error::TaskError;
pub use events::{EventBus, OrchestratorEvent, TaskEvent};
pub use manager::{BatchExportEntry, BatchExportOutcome, BatchFailure, BatchOutcome, TaskManager};
pub use model::{
    ApiMetrics, Checkpoint, CombinedMetrics, ExportFormat, Message, MessageKind, PauseReason,
    StackedTask, SubtaskRelationship, SubtaskResult, Task, TaskDraft, TaskFilters, TaskPatch,
    TaskPauseState, TaskStats, TaskStatus,
};
pub use orchestrator::{SubtaskOrchestrator, SubtaskTicket};
pub use store::TaskStore;

/// Open the store, initialize the lifecycle manager, and construct the
/// orchestrator from one [`EngineConfig`].
///
/// Call [`SubtaskOrchestrator::restore`] afterwards to replay a stack
/// snapshot from a previous run, and
/// [`SubtaskOrchestrator::start_autosave`] to begin periodic snapshots.
pub async fn bootstrap(
    config: &EngineConfig,
) -> error::Result<(Arc<TaskManager>, Arc<SubtaskOrchestrator>)> {
    let store = TaskStore::open_with_slow_query(&config.data_dir, config.slow_query_ms).await?;
    let manager = Arc::new(TaskManager::new(store));
    manager.initialize().await?;
    let orchestrator = Arc::new(SubtaskOrchestrator::new(
        Arc::clone(&manager),
        config.orchestrator.clone(),
        &config.data_dir,
    ));
    Ok((manager, orchestrator))
}
