//! Durable task store over SQLite.
//!
//! One row per task; messages, checkpoints, file changes and tags are JSON
//! text blobs. A derived `messages_text` column plus an FTS5 virtual table
//! back free-text search; triggers keep the index synchronized inside the
//! same transaction as every row mutation, so search never sees a deleted
//! task or stale text.

pub mod export;

use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions as _, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, TaskError};
use crate::model::{
    default_task_text, new_id, now_ms, CombinedMetrics, ExportFormat, Task, TaskDraft, TaskFilters,
    TaskMetadata, TaskPatch, TaskStats, TaskStatus,
};

const DB_FILE: &str = "tasks.db";
const DEFAULT_CONTEXT_WINDOW: i64 = 200_000;

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the engine indefinitely.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(TaskError::Timeout(QUERY_TIMEOUT.as_secs())),
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    completed_at INTEGER,
    text TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('active', 'completed', 'failed', 'terminated')),
    conversation_id TEXT NOT NULL,
    messages_json TEXT NOT NULL DEFAULT '[]',
    messages_text TEXT,
    checkpoints_json TEXT NOT NULL DEFAULT '[]',
    current_checkpoint TEXT,
    context_tokens INTEGER NOT NULL DEFAULT 0,
    context_window INTEGER NOT NULL DEFAULT 200000,

    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    cache_reads INTEGER NOT NULL DEFAULT 0,
    cache_writes INTEGER NOT NULL DEFAULT 0,
    total_cost REAL NOT NULL DEFAULT 0.0,

    version TEXT,
    mode TEXT NOT NULL DEFAULT 'agent',
    model TEXT,
    total_duration INTEGER,
    file_changes_json TEXT DEFAULT '[]',
    tags_json TEXT DEFAULT '[]',
    error TEXT,
    stack TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);
CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks(updated_at);
CREATE INDEX IF NOT EXISTS idx_tasks_conversation_id ON tasks(conversation_id);

CREATE VIRTUAL TABLE IF NOT EXISTS tasks_fts USING fts5(
    id UNINDEXED,
    text,
    messages_text,
    content='tasks',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS tasks_fts_insert AFTER INSERT ON tasks BEGIN
    INSERT INTO tasks_fts(rowid, id, text, messages_text)
    VALUES (new.rowid, new.id, new.text, new.messages_text);
END;

CREATE TRIGGER IF NOT EXISTS tasks_fts_delete AFTER DELETE ON tasks BEGIN
    INSERT INTO tasks_fts(tasks_fts, rowid, id, text, messages_text)
    VALUES ('delete', old.rowid, old.id, old.text, old.messages_text);
END;

CREATE TRIGGER IF NOT EXISTS tasks_fts_update AFTER UPDATE ON tasks BEGIN
    INSERT INTO tasks_fts(tasks_fts, rowid, id, text, messages_text)
    VALUES ('delete', old.rowid, old.id, old.text, old.messages_text);
    INSERT INTO tasks_fts(rowid, id, text, messages_text)
    VALUES (new.rowid, new.id, new.text, new.messages_text);
END;
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
struct TaskRow {
    id: String,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
    text: String,
    status: String,
    conversation_id: String,
    messages_json: String,
    #[allow(dead_code)]
    messages_text: Option<String>,
    checkpoints_json: String,
    current_checkpoint: Option<String>,
    context_tokens: i64,
    context_window: i64,
    tokens_in: i64,
    tokens_out: i64,
    cache_reads: i64,
    cache_writes: i64,
    total_cost: f64,
    version: Option<String>,
    mode: String,
    model: Option<String>,
    total_duration: Option<i64>,
    file_changes_json: Option<String>,
    tags_json: Option<String>,
    error: Option<String>,
    stack: Option<String>,
}

fn row_to_task(row: TaskRow) -> Result<Task> {
    Ok(Task {
        id: row.id,
        created_at: row.created_at,
        updated_at: row.updated_at,
        completed_at: row.completed_at,
        text: row.text,
        // The CHECK constraint on the column guarantees a known value.
        status: TaskStatus::parse(&row.status).unwrap_or(TaskStatus::Active),
        conversation_id: row.conversation_id,
        messages: serde_json::from_str(&row.messages_json)?,
        checkpoints: serde_json::from_str(&row.checkpoints_json)?,
        current_checkpoint: row.current_checkpoint,
        context_tokens: row.context_tokens,
        context_window: row.context_window,
        api_metrics: CombinedMetrics {
            tokens_in: row.tokens_in,
            tokens_out: row.tokens_out,
            cache_reads: row.cache_reads,
            cache_writes: row.cache_writes,
            total_cost: row.total_cost,
            context_tokens: row.context_tokens,
        },
        metadata: TaskMetadata {
            version: row.version.unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            mode: row.mode,
            model: row.model.unwrap_or_else(|| "auto".to_string()),
            total_duration: row.total_duration,
            file_changes: serde_json::from_str(row.file_changes_json.as_deref().unwrap_or("[]"))?,
            tags: serde_json::from_str(row.tags_json.as_deref().unwrap_or("[]"))?,
            error: row.error,
            stack: row.stack,
        },
    })
}

/// Sanitize a user-provided query string for FTS5 MATCH.
///
/// FTS5 has its own query syntax; untrusted input could break the query or
/// cause confusing errors. Special operators are stripped and the cleaned
/// text is wrapped in double-quotes for a literal phrase search.
pub(crate) fn sanitize_fts_query(query: &str) -> String {
    let clean: String = query
        .chars()
        .filter(|c| !matches!(c, '"' | '^' | '(' | ')' | '*'))
        .collect();
    let clean = clean.trim();
    format!("\"{}\"", clean.replace('\\', ""))
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Open (or create) the task database under `data_dir`.
    ///
    /// Failure here is fatal to startup — there is no degraded mode without
    /// the store.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        Self::open_with_slow_query(data_dir, 0).await
    }

    /// Open the store with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding it
    /// are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn open_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join(DB_FILE);
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!(path = %db_path.display(), "task store opened");
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Close the underlying pool. Subsequent queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ─── CRUD ────────────────────────────────────────────────────────────────

    /// Create a task, filling defaults for everything the draft leaves out.
    pub async fn create(&self, draft: TaskDraft) -> Result<Task> {
        let now = now_ms();
        let mut metrics = draft.api_metrics.unwrap_or_default();
        metrics.context_tokens = metrics.tokens_in.saturating_add(metrics.tokens_out);

        let task = Task {
            id: draft.id.unwrap_or_else(new_id),
            text: draft.text.unwrap_or_else(default_task_text),
            status: draft.status.unwrap_or(TaskStatus::Active),
            created_at: now,
            updated_at: now,
            completed_at: draft.completed_at,
            conversation_id: draft.conversation_id.unwrap_or_else(new_id),
            messages: draft.messages,
            context_tokens: metrics.context_tokens,
            context_window: draft.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW),
            api_metrics: metrics,
            checkpoints: draft.checkpoints,
            current_checkpoint: draft.current_checkpoint,
            metadata: draft.metadata.unwrap_or_default(),
        };

        sqlx::query(
            "INSERT INTO tasks (
                id, created_at, updated_at, completed_at, text, status,
                conversation_id, messages_json, messages_text, checkpoints_json, current_checkpoint,
                context_tokens, context_window,
                tokens_in, tokens_out, cache_reads, cache_writes, total_cost,
                version, mode, model, total_duration, file_changes_json, tags_json, error, stack
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .bind(task.completed_at)
        .bind(&task.text)
        .bind(task.status.as_str())
        .bind(&task.conversation_id)
        .bind(serde_json::to_string(&task.messages)?)
        .bind(task.messages_text())
        .bind(serde_json::to_string(&task.checkpoints)?)
        .bind(&task.current_checkpoint)
        .bind(task.context_tokens)
        .bind(task.context_window)
        .bind(task.api_metrics.tokens_in)
        .bind(task.api_metrics.tokens_out)
        .bind(task.api_metrics.cache_reads)
        .bind(task.api_metrics.cache_writes)
        .bind(task.api_metrics.total_cost)
        .bind(&task.metadata.version)
        .bind(&task.metadata.mode)
        .bind(&task.metadata.model)
        .bind(task.metadata.total_duration)
        .bind(serde_json::to_string(&task.metadata.file_changes)?)
        .bind(serde_json::to_string(&task.metadata.tags)?)
        .bind(&task.metadata.error)
        .bind(&task.metadata.stack)
        .execute(&self.pool)
        .await?;

        debug!(id = %task.id, "task created");
        Ok(task)
    }

    /// Fetch a task, `None` when absent.
    pub async fn try_get(&self, id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_task).transpose()
    }

    /// Fetch a task, `NotFound` when absent.
    pub async fn get(&self, id: &str) -> Result<Task> {
        self.try_get(id)
            .await?
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    /// Merge a partial update into an existing task and persist it.
    ///
    /// Read-modify-write with no optimistic-concurrency guard: two concurrent
    /// updates to one id resolve last-writer-wins.
    pub async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        let mut task = self.get(id).await?;
        task.apply(patch);
        task.updated_at = now_ms().max(task.updated_at);

        sqlx::query(
            "UPDATE tasks SET
                updated_at = ?,
                completed_at = ?,
                text = ?,
                status = ?,
                messages_json = ?,
                messages_text = ?,
                checkpoints_json = ?,
                current_checkpoint = ?,
                context_tokens = ?,
                context_window = ?,
                tokens_in = ?,
                tokens_out = ?,
                cache_reads = ?,
                cache_writes = ?,
                total_cost = ?,
                mode = ?,
                model = ?,
                total_duration = ?,
                file_changes_json = ?,
                tags_json = ?,
                error = ?,
                stack = ?
            WHERE id = ?",
        )
        .bind(task.updated_at)
        .bind(task.completed_at)
        .bind(&task.text)
        .bind(task.status.as_str())
        .bind(serde_json::to_string(&task.messages)?)
        .bind(task.messages_text())
        .bind(serde_json::to_string(&task.checkpoints)?)
        .bind(&task.current_checkpoint)
        .bind(task.context_tokens)
        .bind(task.context_window)
        .bind(task.api_metrics.tokens_in)
        .bind(task.api_metrics.tokens_out)
        .bind(task.api_metrics.cache_reads)
        .bind(task.api_metrics.cache_writes)
        .bind(task.api_metrics.total_cost)
        .bind(&task.metadata.mode)
        .bind(&task.metadata.model)
        .bind(task.metadata.total_duration)
        .bind(serde_json::to_string(&task.metadata.file_changes)?)
        .bind(serde_json::to_string(&task.metadata.tags)?)
        .bind(&task.metadata.error)
        .bind(&task.metadata.stack)
        .bind(id)
        .execute(&self.pool)
        .await?;

        debug!(id = %id, "task updated");
        Ok(task)
    }

    /// Delete a task. Returns `true` when a row was removed. The FTS entry
    /// goes with it in the same transaction (delete trigger).
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            debug!(id = %id, "task deleted");
        }
        Ok(deleted)
    }

    // ─── Listing & search ────────────────────────────────────────────────────

    /// Filtered, sorted, paginated listing. A `search` filter routes through
    /// the FTS index; a `status` filter then narrows the text-matched set.
    /// `t.id` is a tiebreaker so pagination is stable under a fixed sort key.
    pub async fn list(&self, filters: &TaskFilters) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT t.* FROM tasks t");
        let mut binds: Vec<String> = Vec::new();

        let search = filters
            .search
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty());

        if let Some(query) = search {
            sql.push_str(" JOIN tasks_fts ON tasks_fts.rowid = t.rowid WHERE tasks_fts MATCH ?");
            binds.push(sanitize_fts_query(query));
            if let Some(status) = filters.status {
                sql.push_str(" AND t.status = ?");
                binds.push(status.as_str().to_string());
            }
        } else if let Some(status) = filters.status {
            sql.push_str(" WHERE t.status = ?");
            binds.push(status.as_str().to_string());
        }

        sql.push_str(&format!(
            " ORDER BY t.{} {}, t.id ASC",
            filters.sort_by.column(),
            filters.sort_order.sql()
        ));

        match (filters.limit, filters.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            // OFFSET requires LIMIT in SQLite; -1 means unbounded.
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }

        with_timeout(async {
            let mut query = sqlx::query_as::<_, TaskRow>(&sql);
            for bind in &binds {
                query = query.bind(bind);
            }
            let rows = query.fetch_all(&self.pool).await?;
            rows.into_iter().map(row_to_task).collect()
        })
        .await
    }

    /// Per-status counts. All zero (never null) on an empty store.
    pub async fn stats(&self) -> Result<TaskStats> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT
                COUNT(*),
                COALESCE(SUM(status = 'active'), 0),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status = 'terminated'), 0)
             FROM tasks",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(TaskStats {
            total: row.0,
            active: row.1,
            completed: row.2,
            failed: row.3,
            terminated: row.4,
        })
    }

    pub async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as u64)
    }

    /// Render a task in the given export format.
    pub async fn export(&self, id: &str, format: ExportFormat) -> Result<String> {
        let task = self.get(id).await?;
        export::render(&task, format)
    }

    /// Run SQLite VACUUM to reclaim disk space after bulk deletes.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_special_chars() {
        let q = sanitize_fts_query("hello (world)^2");
        assert!(!q.contains('('));
        assert!(!q.contains(')'));
        assert!(!q.contains('^'));
        assert!(q.starts_with('"'));
        assert!(q.ends_with('"'));
    }

    #[test]
    fn sanitize_preserves_plain_text() {
        let q = sanitize_fts_query("fix login flow");
        assert!(q.contains("fix login flow"));
    }

    #[test]
    fn sanitize_empty_query() {
        assert_eq!(sanitize_fts_query(""), "\"\"");
    }

    #[test]
    fn sanitize_unicode_preserved() {
        let q = sanitize_fts_query("über résumé");
        assert!(q.contains("über"));
        assert!(q.contains("résumé"));
    }
}
