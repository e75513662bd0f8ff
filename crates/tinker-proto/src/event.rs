//! The closed event vocabulary.
//!
//! Every notification the task loop publishes is one of the variants below.
//! Handlers match on the variant they care about; there is no string-keyed
//! registration and no open-ended payload map.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one task.
///
/// Generated once at submission and carried by every event, round record,
/// and persisted document that belongs to the task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wraps an existing id string (e.g. read back from disk).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A notification published by the task loop.
///
/// Events are transient: they are delivered synchronously to all current
/// subscribers and not persisted by the bus itself. A subscriber (such as the
/// JSONL event logger) may choose to persist them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum Event {
    /// A task transitioned to RUNNING.
    TaskStart {
        task_id: TaskId,
        instruction: String,
    },
    /// A round began.
    RoundStart { task_id: TaskId, round: u32 },
    /// The LLM is being queried.
    QueryStart {
        task_id: TaskId,
        round: u32,
        llm: String,
    },
    /// One incremental chunk of streamed LLM output.
    Stream { task_id: TaskId, chunk: String },
    /// The LLM reply is fully assembled.
    QueryEnd {
        task_id: TaskId,
        round: u32,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// A code block is about to execute.
    ExecStart {
        task_id: TaskId,
        round: u32,
        block: String,
        lang: String,
    },
    /// A code block finished executing.
    ExecResult {
        task_id: TaskId,
        round: u32,
        block: String,
        success: bool,
        duration_ms: u64,
    },
    /// A tool-call directive is being dispatched.
    ToolCall {
        task_id: TaskId,
        round: u32,
        tool: String,
    },
    /// A tool-call directive finished.
    ToolResult {
        task_id: TaskId,
        round: u32,
        tool: String,
        success: bool,
    },
    /// A round closed. `outcome` is one of `continue`, `final_answer`,
    /// `failed`.
    RoundEnd {
        task_id: TaskId,
        round: u32,
        outcome: String,
    },
    /// A task reached a terminal state. `status` is the terminal
    /// [`TaskStatus`](https://docs.rs/tinker-core) as a string.
    TaskEnd {
        task_id: TaskId,
        status: String,
        rounds: u32,
        truncated: bool,
    },
    /// An internal failure that was absorbed (save errors, subscriber
    /// panics observed by the bus, sandbox infrastructure faults).
    Exception {
        task_id: TaskId,
        context: String,
        message: String,
    },
}

impl Event {
    /// Returns the stable wire name of this event.
    ///
    /// These strings form the closed vocabulary used in logs and by
    /// external observers; they never change across releases.
    pub fn name(&self) -> &'static str {
        match self {
            Event::TaskStart { .. } => "task_start",
            Event::RoundStart { .. } => "round_start",
            Event::QueryStart { .. } => "query_start",
            Event::Stream { .. } => "stream",
            Event::QueryEnd { .. } => "query_end",
            Event::ExecStart { .. } => "exec_start",
            Event::ExecResult { .. } => "exec_result",
            Event::ToolCall { .. } => "tool_call",
            Event::ToolResult { .. } => "tool_result",
            Event::RoundEnd { .. } => "round_end",
            Event::TaskEnd { .. } => "task_end",
            Event::Exception { .. } => "exception",
        }
    }

    /// Returns the id of the task this event belongs to.
    pub fn task_id(&self) -> &TaskId {
        match self {
            Event::TaskStart { task_id, .. }
            | Event::RoundStart { task_id, .. }
            | Event::QueryStart { task_id, .. }
            | Event::Stream { task_id, .. }
            | Event::QueryEnd { task_id, .. }
            | Event::ExecStart { task_id, .. }
            | Event::ExecResult { task_id, .. }
            | Event::ToolCall { task_id, .. }
            | Event::ToolResult { task_id, .. }
            | Event::RoundEnd { task_id, .. }
            | Event::TaskEnd { task_id, .. }
            | Event::Exception { task_id, .. } => task_id,
        }
    }
}
