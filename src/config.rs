//! Engine configuration (`taskstack.toml`).
//!
//! Every field has a default so a missing or partial config file is fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

const DEFAULT_MAX_DEPTH: u32 = 3;
const DEFAULT_MAX_CONCURRENT_SUBTASKS: usize = 1;
const DEFAULT_SNAPSHOT_INTERVAL_SECS: u64 = 30;

fn default_data_dir() -> PathBuf {
    PathBuf::from(".taskstack")
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the SQLite database and stack snapshots.
    pub data_dir: PathBuf,
    /// Slow-query log threshold in milliseconds. 0 disables it.
    pub slow_query_ms: u64,
    pub orchestrator: OrchestratorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            slow_query_ms: 0,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file. A missing file yields defaults;
    /// a malformed file is reported and also yields defaults rather than
    /// aborting startup.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), err = %e, "invalid config file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

/// Subtask orchestrator knobs (`[orchestrator]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum nesting depth for subtasks. Root tasks sit at depth 0.
    pub max_depth: u32,
    /// Reserved: parallel subtask cap. The default of 1 means sequential
    /// execution; values above 1 are accepted but not yet scheduled.
    pub max_concurrent_subtasks: usize,
    /// Gates the explicit `pause_task` / `resume_task` surface. Subtask-driven
    /// pause and resume are always on.
    pub enable_pause_resume: bool,
    /// Interval between stack snapshots, in seconds.
    pub snapshot_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_concurrent_subtasks: DEFAULT_MAX_CONCURRENT_SUBTASKS,
            enable_pause_resume: true,
            snapshot_interval_secs: DEFAULT_SNAPSHOT_INTERVAL_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.orchestrator.max_depth, 3);
        assert_eq!(cfg.orchestrator.max_concurrent_subtasks, 1);
        assert!(cfg.orchestrator.enable_pause_resume);
    }

    #[test]
    fn partial_toml_fills_missing_fields() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [orchestrator]
            max_depth = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.orchestrator.max_depth, 5);
        assert_eq!(cfg.orchestrator.snapshot_interval_secs, 30);
        assert_eq!(cfg.data_dir, PathBuf::from(".taskstack"));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = EngineConfig::load(Path::new("/nonexistent/taskstack.toml"));
        assert_eq!(cfg.orchestrator.max_depth, 3);
    }
}
