//! Persistent task storage.
//!
//! One JSON document per task under `<state_dir>/tasks/<id>.json`.
//! Listing skips unreadable documents with a warning instead of failing:
//! a corrupted file must not take down task listing for everyone else.

use crate::task::{TaskRecord, TaskStatus};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tinker_proto::TaskId;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task document malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no stored task with id `{0}`")]
    NotFound(String),
}

/// Summary row for task listing.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: TaskId,
    pub created: DateTime<Utc>,
    pub status: TaskStatus,
    pub truncated: bool,
    pub instruction: String,
    pub rounds: u32,
}

/// Stores task records as JSON documents on disk.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    /// Creates a store rooted at the given state directory. Directories are
    /// created lazily on first save.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: state_dir.into().join("tasks"),
        }
    }

    fn path_for(&self, id: &TaskId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Writes a task record, overwriting any previous document.
    pub fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(self.path_for(&record.id), json)?;
        Ok(())
    }

    /// Loads one task record.
    pub fn load(&self, id: &TaskId) -> Result<TaskRecord, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Lists stored tasks, newest first. Malformed documents are skipped
    /// with a warning.
    pub fn list(&self) -> Result<Vec<TaskSummary>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => summaries.push(TaskSummary {
                    id: record.id,
                    created: record.created,
                    status: record.status,
                    truncated: record.truncated,
                    instruction: record.instruction,
                    rounds: record.stats.rounds,
                }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable task document");
                }
            }
        }
        summaries.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(summaries)
    }
}

fn read_record(path: &Path) -> Result<TaskRecord, StoreError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
