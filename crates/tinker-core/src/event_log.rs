//! JSONL event logging for debugging and post-mortem analysis.
//!
//! The logger is an ordinary broadcast subscriber: attach it to the bus and
//! every event becomes one line in `<state_dir>/events.jsonl`. Payloads are
//! truncated at a UTF-8 character boundary so a streamed megabyte of LLM
//! output does not bloat the log.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tinker_proto::{Event, EventBus};
use tracing::{debug, warn};

/// One logged line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// ISO 8601 timestamp.
    pub ts: String,
    /// Event name from the closed vocabulary.
    pub name: String,
    /// Task the event belongs to.
    pub task_id: String,
    /// Serialized payload, truncated if large.
    pub payload: String,
}

impl EventRecord {
    /// Maximum payload length before truncation.
    const MAX_PAYLOAD_LEN: usize = 500;

    pub fn new(event: &Event) -> Self {
        let payload = serde_json::to_string(event).unwrap_or_else(|e| format!("<unserializable: {e}>"));
        let payload = if payload.len() > Self::MAX_PAYLOAD_LEN {
            // Walk back from the limit to a valid char boundary.
            let mut cut = Self::MAX_PAYLOAD_LEN;
            while cut > 0 && !payload.is_char_boundary(cut) {
                cut -= 1;
            }
            format!(
                "{}... [truncated, {} chars total]",
                &payload[..cut],
                payload.chars().count()
            )
        } else {
            payload
        };

        Self {
            ts: chrono::Utc::now().to_rfc3339(),
            name: event.name().to_string(),
            task_id: event.task_id().to_string(),
            payload,
        }
    }
}

/// Appends event records to a JSONL file.
pub struct EventLogger {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl EventLogger {
    /// File name under the state directory.
    pub const FILE_NAME: &'static str = "events.jsonl";

    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: state_dir.into().join(Self::FILE_NAME),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logs one event. Errors are absorbed with a warning: logging must
    /// never interrupt the loop.
    pub fn log(&self, event: &Event) {
        let record = EventRecord::new(event);
        if let Err(e) = self.append(&record) {
            warn!(error = %e, "Failed to write event log line");
        }
    }

    fn append(&self, record: &EventRecord) -> std::io::Result<()> {
        let mut guard = self.file.lock().expect("event log file lock poisoned");
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            *guard = Some(file);
        }
        let file = guard.as_mut().unwrap();
        let mut json = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        json.push('\n');
        // Single write_all keeps the append atomic on POSIX with O_APPEND.
        file.write_all(json.as_bytes())?;
        file.flush()?;
        debug!(name = %record.name, "Event logged");
        Ok(())
    }

    /// Registers this logger on the bus.
    pub fn attach(self: Arc<Self>, bus: &EventBus) {
        bus.subscribe("event-logger", move |event| self.log(event));
    }
}
