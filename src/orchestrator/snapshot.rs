//! Durable stack snapshots.
//!
//! The orchestrator's stack lives outside the task store: a JSON file under
//! the data directory, rewritten atomically (tmp + rename) on every snapshot
//! and replayed on startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{SubtaskRelationship, TaskPauseState};

const SNAPSHOT_FILE: &str = "task_stack.json";

/// One stack frame as persisted: the task id plus the orchestration metadata
/// that is not stored as primary task fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub task_id: String,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<i64>,
    pub relationship: SubtaskRelationship,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_state: Option<TaskPauseState>,
}

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SNAPSHOT_FILE),
        }
    }

    /// Persist the full stack. The write goes to a temp file first so a crash
    /// mid-write never corrupts the previous snapshot.
    pub async fn save(&self, entries: &[SnapshotEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(
            count = entries.len(),
            file = %self.path.display(),
            "task stack snapshot saved"
        );
        Ok(())
    }

    /// Load the last snapshot. Missing file means an empty stack; a corrupt
    /// file is reported and treated as empty rather than blocking startup.
    pub async fn load(&self) -> Result<Vec<SnapshotEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!(
                    file = %self.path.display(),
                    err = %e,
                    "skipping corrupt stack snapshot"
                );
                Ok(Vec::new())
            }
        }
    }
}
