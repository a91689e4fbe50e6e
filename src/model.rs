//! Core data model: tasks, messages, metrics, checkpoints, and the
//! subtask-relationship types layered on top by the orchestrator.
//!
//! Serialized field names are camelCase to match the wire shape handed to the
//! rendering surface.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a new UUID v4 string (task / conversation / checkpoint IDs).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Default text for a task created without one.
pub fn default_task_text() -> String {
    format!("Task {}", Utc::now().format("%Y-%m-%d %H:%M:%S"))
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Task lifecycle status. Terminal states can be resumed back to `Active`
/// via an explicit resume; `completed_at` is kept as history when that happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
    Terminated,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "terminated" => Some(TaskStatus::Terminated),
            _ => None,
        }
    }

    /// `completed`, `failed` and `terminated` are terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Active)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Messages & metrics ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Ask,
    Say,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ask => "ask",
            MessageKind::Say => "say",
        }
    }
}

/// Per-message API usage fragment. All fields optional — a message either
/// carries usage data from a model round-trip or it doesn't.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_reads: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_writes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_request_id: Option<String>,
}

/// Accumulated API usage for a whole task. Counters only ever increase;
/// `context_tokens` is derived (`tokens_in + tokens_out`), never set directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedMetrics {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cache_reads: i64,
    pub cache_writes: i64,
    pub total_cost: f64,
    pub context_tokens: i64,
}

impl CombinedMetrics {
    /// Fold a per-message fragment into the running totals and re-derive
    /// `context_tokens`.
    pub fn absorb(&mut self, fragment: &ApiMetrics) {
        self.tokens_in = self.tokens_in.saturating_add(fragment.tokens_in.unwrap_or(0));
        self.tokens_out = self.tokens_out.saturating_add(fragment.tokens_out.unwrap_or(0));
        self.cache_reads = self.cache_reads.saturating_add(fragment.cache_reads.unwrap_or(0));
        self.cache_writes = self
            .cache_writes
            .saturating_add(fragment.cache_writes.unwrap_or(0));
        self.total_cost += fragment.cost.unwrap_or(0.0);
        self.context_tokens = self.tokens_in.saturating_add(self.tokens_out);
    }
}

/// One conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_metrics: Option<ApiMetrics>,
}

impl Message {
    pub fn say(text: impl Into<String>) -> Self {
        Self {
            ts: now_ms(),
            kind: MessageKind::Say,
            text: Some(text.into()),
            images: Vec::new(),
            partial: false,
            api_metrics: None,
        }
    }

    pub fn ask(text: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Ask,
            ..Self::say(text)
        }
    }

    pub fn with_metrics(mut self, metrics: ApiMetrics) -> Self {
        self.api_metrics = Some(metrics);
        self
    }
}

// ─── Metadata ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: FileChangeKind,
    pub timestamp: i64,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_mode() -> String {
    "agent".to_string()
}

fn default_model() -> String {
    "auto".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskMetadata {
    /// Engine version that created the task.
    pub version: String,
    /// Operating mode the task runs under (e.g. "agent", "architect", "ask").
    pub mode: String,
    /// Model identifier, or "auto" for routed selection.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub file_changes: Vec<FileChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Error message for `failed` tasks, or the reason for `terminated` ones.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            version: default_version(),
            mode: default_mode(),
            model: default_model(),
            total_duration: None,
            file_changes: Vec::new(),
            tags: Vec::new(),
            error: None,
            stack: None,
        }
    }
}

// ─── Checkpoints ─────────────────────────────────────────────────────────────

/// A saved point in a task's message history. Restoring truncates `messages`
/// to `message_index`; later entries are discarded irrecoverably.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub timestamp: i64,
    pub message_index: usize,
    pub context_tokens: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// ─── Task ────────────────────────────────────────────────────────────────────

/// A unit of tracked work: conversation history, accumulated usage metrics,
/// checkpoints, and lifecycle status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub text: String,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    pub conversation_id: String,
    pub messages: Vec<Message>,
    pub api_metrics: CombinedMetrics,
    pub context_tokens: i64,
    pub context_window: i64,
    pub checkpoints: Vec<Checkpoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_checkpoint: Option<String>,
    pub metadata: TaskMetadata,
}

impl Task {
    /// Concatenated plain text of all messages — the derived search column.
    pub fn messages_text(&self) -> String {
        self.messages
            .iter()
            .filter_map(|m| m.text.as_deref())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Merge a partial update into this task. `updated_at` is bumped by the
    /// store, not here.
    pub fn apply(&mut self, patch: TaskPatch) {
        if let Some(text) = patch.text {
            self.text = text;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(messages) = patch.messages {
            self.messages = messages;
        }
        if let Some(metrics) = patch.api_metrics {
            self.api_metrics = metrics;
            self.context_tokens = self
                .api_metrics
                .tokens_in
                .saturating_add(self.api_metrics.tokens_out);
            self.api_metrics.context_tokens = self.context_tokens;
        }
        if let Some(checkpoints) = patch.checkpoints {
            self.checkpoints = checkpoints;
        }
        if let Some(current_checkpoint) = patch.current_checkpoint {
            self.current_checkpoint = Some(current_checkpoint);
        }
        if let Some(context_window) = patch.context_window {
            self.context_window = context_window;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata = metadata;
        }
    }
}

/// Fields a caller may supply when creating a task; everything else is
/// defaulted (generated IDs, zeroed metrics, empty collections).
#[derive(Debug, Clone, Default)]
pub struct TaskDraft {
    pub id: Option<String>,
    pub text: Option<String>,
    pub status: Option<TaskStatus>,
    pub completed_at: Option<i64>,
    pub conversation_id: Option<String>,
    pub messages: Vec<Message>,
    pub checkpoints: Vec<Checkpoint>,
    pub current_checkpoint: Option<String>,
    pub context_window: Option<i64>,
    pub api_metrics: Option<CombinedMetrics>,
    pub metadata: Option<TaskMetadata>,
}

/// Partial update for [`TaskStore::update`](crate::store::TaskStore::update).
/// Absent fields are left untouched. `context_tokens` is deliberately not
/// patchable — it is re-derived whenever metrics change.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub text: Option<String>,
    pub status: Option<TaskStatus>,
    pub completed_at: Option<i64>,
    pub messages: Option<Vec<Message>>,
    pub api_metrics: Option<CombinedMetrics>,
    pub checkpoints: Option<Vec<Checkpoint>>,
    pub current_checkpoint: Option<String>,
    pub context_window: Option<i64>,
    pub metadata: Option<TaskMetadata>,
}

// ─── Listing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    CreatedAt,
    #[default]
    UpdatedAt,
}

impl SortKey {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SortKey::CreatedAt => "created_at",
            SortKey::UpdatedAt => "updated_at",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilters {
    pub status: Option<TaskStatus>,
    /// Free-text query against the full-text index (task text + messages).
    pub search: Option<String>,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub terminated: i64,
}

// ─── Export ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Txt,
    Md,
}

impl std::str::FromStr for ExportFormat {
    type Err = crate::error::TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ExportFormat::Json),
            "txt" => Ok(ExportFormat::Txt),
            "md" => Ok(ExportFormat::Md),
            other => Err(crate::error::TaskError::UnsupportedFormat(other.to_string())),
        }
    }
}

// ─── Subtask types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PauseReason {
    UserRequest,
    WaitingForSubtask,
    System,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::UserRequest => "user-request",
            PauseReason::WaitingForSubtask => "waiting-for-subtask",
            PauseReason::System => "system",
        }
    }
}

/// Suspension marker, distinct from the stored status value. Presence means
/// the task is logically suspended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPauseState {
    pub paused_at: i64,
    pub reason: PauseReason,
    pub message_index_at_pause: usize,
    pub resumable: bool,
}

/// Parent/child linkage for a task on the orchestrator stack.
/// `depth` is 0 for root tasks and `parent.depth + 1` for subtasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskRelationship {
    pub parent_task_id: Option<String>,
    pub child_task_ids: Vec<String>,
    pub depth: u32,
    pub sibling_index: usize,
}

impl SubtaskRelationship {
    pub fn root() -> Self {
        Self {
            parent_task_id: None,
            child_task_ids: Vec::new(),
            depth: 0,
            sibling_index: 0,
        }
    }
}

/// A task enriched with its orchestration view (relationship + pause state).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackedTask {
    #[serde(flatten)]
    pub task: Task,
    pub relationship: SubtaskRelationship,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_state: Option<TaskPauseState>,
}

/// Result bundle handed to a parent when one of its subtasks finishes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub messages: Vec<Message>,
    pub file_changes: Vec<FileChange>,
    pub api_metrics: CombinedMetrics,
}
