//! File-backed checkpoint store for crash recovery.
//!
//! Each session owns a directory under the store root holding:
//! - `latest.json` — the most recent full checkpoint, always overwritten
//! - `cp_<iteration>.json` — numbered history of full checkpoints
//! - `hybrid_stage_<stageId>.json` — per-stage snapshots
//! - `task_<stageId>_<taskId>.json` — per-task records written as tasks
//!   complete
//!
//! Writes are atomic (temp file + rename) so concurrent readers always see
//! either the old or the new contents. One writer per session is enforced
//! with an advisory `fs2` lock on the session directory. Readers tolerate
//! missing or malformed files by returning None.

use crate::errors::CheckpointError;
use crate::plan::{StagePlan, TaskProgress};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Default number of numbered checkpoints retained by cleanup.
pub const DEFAULT_MAX_KEEP: usize = 5;

/// A full orchestrator checkpoint, sufficient to resume at a stage
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub iteration: u64,
    pub phase: String,
    pub stage_index: usize,
    pub stage_plan: StagePlan,
    #[serde(default)]
    pub task_progress: HashMap<String, TaskProgress>,
    /// Accumulated prior-stage context, so a resumed run rebuilds its
    /// prompts without re-executing stages.
    #[serde(default)]
    pub prior_context: String,
    /// Completion percentage at save time.
    #[serde(default)]
    pub last_progress: f64,
}

/// Cleanup policy for numbered checkpoints.
#[derive(Debug, Clone, Copy)]
pub struct CleanupPolicy {
    /// How many numbered `cp_*` checkpoints to retain.
    pub max_keep: usize,
    /// Retain `hybrid_stage_*` and `task_*` entries.
    pub keep_stage_checkpoints: bool,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_keep: DEFAULT_MAX_KEEP,
            keep_stage_checkpoints: true,
        }
    }
}

/// Guard holding the session's single-writer lock. The lock releases when
/// the guard drops.
#[derive(Debug)]
pub struct SessionLock {
    _file: File,
}

/// File-backed checkpoint store rooted at a directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store rooted under the project directory (`.crucible/checkpoints`).
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(project_dir.join(".crucible").join("checkpoints"))
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    fn ensure_session_dir(&self, session_id: &str) -> Result<PathBuf, CheckpointError> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::DirCreateFailed {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    /// Acquire the session's single-writer lock. Fails fast when another
    /// writer holds it.
    pub fn lock_session(&self, session_id: &str) -> Result<SessionLock, CheckpointError> {
        let dir = self.ensure_session_dir(session_id)?;
        let lock_path = dir.join(".lock");
        let file = File::create(&lock_path).map_err(|source| CheckpointError::WriteFailed {
            path: lock_path,
            source,
        })?;
        file.try_lock_exclusive()
            .map_err(|_| CheckpointError::SessionLocked {
                session_id: session_id.to_string(),
            })?;
        Ok(SessionLock { _file: file })
    }

    fn write_atomic(&self, path: &Path, json: &str) -> Result<(), CheckpointError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|source| CheckpointError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, path).map_err(|source| CheckpointError::WriteFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    fn read_json(path: &Path) -> Option<Value> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Write a full checkpoint: both `latest.json` and the numbered
    /// `cp_<iteration>.json`.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let dir = self.ensure_session_dir(&checkpoint.session_id)?;
        let json = serde_json::to_string_pretty(checkpoint).map_err(|source| {
            CheckpointError::SerializeFailed {
                session_id: checkpoint.session_id.clone(),
                source,
            }
        })?;
        self.write_atomic(&dir.join("latest.json"), &json)?;
        self.write_atomic(&dir.join(format!("cp_{}.json", checkpoint.iteration)), &json)
    }

    /// Load a checkpoint by name (default `latest`). Missing or malformed
    /// files return None.
    pub fn load_checkpoint(&self, session_id: &str, name: &str) -> Option<Checkpoint> {
        let path = self.session_dir(session_id).join(format!("{name}.json"));
        let value = Self::read_json(&path)?;
        serde_json::from_value(value).ok()
    }

    /// Load the latest checkpoint for a session.
    pub fn load_latest(&self, session_id: &str) -> Option<Checkpoint> {
        self.load_checkpoint(session_id, "latest")
    }

    /// Write a per-stage snapshot (`hybrid_stage_<stageId>.json`).
    pub fn save_stage_checkpoint(
        &self,
        session_id: &str,
        stage_id: &str,
        data: &Value,
    ) -> Result<(), CheckpointError> {
        let dir = self.ensure_session_dir(session_id)?;
        let wrapped = wrap_payload(session_id, data);
        let json = serde_json::to_string_pretty(&wrapped).map_err(|source| {
            CheckpointError::SerializeFailed {
                session_id: session_id.to_string(),
                source,
            }
        })?;
        self.write_atomic(&dir.join(format!("hybrid_stage_{stage_id}.json")), &json)
    }

    /// Write a per-task record (`task_<stageId>_<taskId>.json`).
    pub fn save_task_checkpoint(
        &self,
        session_id: &str,
        stage_id: &str,
        task_id: &str,
        data: &Value,
    ) -> Result<(), CheckpointError> {
        let dir = self.ensure_session_dir(session_id)?;
        let wrapped = wrap_payload(session_id, data);
        let json = serde_json::to_string_pretty(&wrapped).map_err(|source| {
            CheckpointError::SerializeFailed {
                session_id: session_id.to_string(),
                source,
            }
        })?;
        self.write_atomic(&dir.join(format!("task_{stage_id}_{task_id}.json")), &json)
    }

    /// Load all task records for a stage, keyed by task id.
    pub fn load_task_checkpoints(&self, session_id: &str, stage_id: &str) -> HashMap<String, Value> {
        let dir = self.session_dir(session_id);
        let prefix = format!("task_{stage_id}_");
        let mut records = HashMap::new();

        let Ok(entries) = fs::read_dir(&dir) else {
            return records;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Some(task_id) = stem.strip_prefix(&prefix) else {
                continue;
            };
            if task_id.is_empty() {
                continue;
            }
            if let Some(value) = Self::read_json(&entry.path()) {
                records.insert(task_id.to_string(), value);
            }
        }
        records
    }

    /// List checkpoint names (without extension) for a session, sorted
    /// lexicographically. Includes `latest` when present.
    pub fn list_checkpoints(&self, session_id: &str) -> Vec<String> {
        let dir = self.session_dir(session_id);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_suffix(".json")
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        names
    }

    /// Delete numbered checkpoints beyond the last `max_keep`, always
    /// retaining `latest`, `hybrid_stage_*`, and (per policy) `task_*`
    /// entries. Returns the number of files deleted.
    pub fn cleanup_checkpoints(&self, session_id: &str, policy: CleanupPolicy) -> usize {
        let dir = self.session_dir(session_id);
        let Ok(entries) = fs::read_dir(&dir) else {
            return 0;
        };

        let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
        let mut task_files: Vec<PathBuf> = Vec::new();

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            if stem == "latest" || stem.starts_with("hybrid_stage_") {
                continue;
            }
            if stem.starts_with("task_") {
                task_files.push(entry.path());
                continue;
            }
            if let Some(n) = stem.strip_prefix("cp_").and_then(|n| n.parse().ok()) {
                numbered.push((n, entry.path()));
            }
        }

        let mut deleted = 0;
        numbered.sort_by_key(|(n, _)| *n);
        if numbered.len() > policy.max_keep {
            let drop_count = numbered.len() - policy.max_keep;
            for (_, path) in numbered.into_iter().take(drop_count) {
                if fs::remove_file(path).is_ok() {
                    deleted += 1;
                }
            }
        }

        if !policy.keep_stage_checkpoints {
            for path in task_files {
                if fs::remove_file(path).is_ok() {
                    deleted += 1;
                }
            }
        }

        deleted
    }
}

fn wrap_payload(session_id: &str, data: &Value) -> Value {
    let mut wrapped = serde_json::Map::new();
    wrapped.insert("session_id".to_string(), Value::String(session_id.into()));
    wrapped.insert(
        "saved_at".to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    if let Value::Object(map) = data {
        for (k, v) in map {
            wrapped.insert(k.clone(), v.clone());
        }
    } else {
        wrapped.insert("data".to_string(), data.clone());
    }
    Value::Object(wrapped)
}

/// Validate a checkpoint's structure for resume. The stage plan must hold
/// an ordered stage list, the stage index must not exceed it, and when
/// resuming mid-plan the previously executed stage must exist. Any failure
/// discards the checkpoint.
pub fn validate_checkpoint(checkpoint: &Checkpoint) -> bool {
    let stage_count = checkpoint.stage_plan.stages.len();
    if stage_count == 0 {
        return false;
    }
    if checkpoint.stage_index > stage_count {
        return false;
    }
    if checkpoint.stage_index > 0 && checkpoint.stage_index - 1 >= stage_count {
        return false;
    }
    true
}
