//! Error taxonomy for the task engine.
//!
//! Single-item operations propagate these to the immediate caller with no
//! internal retry; batch operations convert per-item failures into
//! `{id, error}` entries instead of propagating.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task manager not initialized")]
    NotInitialized,

    #[error("maximum subtask depth ({max}) exceeded")]
    MaxDepthExceeded { depth: u32, max: u32 },

    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("checkpoint {checkpoint_id} not found on task {task_id}")]
    CheckpointNotFound {
        task_id: String,
        checkpoint_id: String,
    },

    /// Orchestrator precondition: an operation that needs a current task was
    /// called with an empty stack.
    #[error("no active task")]
    NoActiveTask,

    #[error("subtask {task_id} failed: {message}")]
    SubtaskFailed { task_id: String, message: String },

    #[error("database query timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TaskError>;
