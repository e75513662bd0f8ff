//! Task lifecycle: one user objective driven through rounds to a terminal
//! state.
//!
//! The task controller owns everything a task accumulates - namespace,
//! block store, conversation history, round records - and drives the round
//! controller until one of the termination conditions fires. After each
//! round, conditions are evaluated in priority order: cancellation, round
//! failure, final answer, round-count limit. Terminal states are final; a
//! finished controller cannot be resumed, though a new task may be seeded
//! from a stored namespace snapshot.

use crate::block::BlockStore;
use crate::install::{DependencyInstaller, NoInstaller};
use crate::llm::{ChatMessage, LlmClient, Usage};
use crate::round::{self, RoundController, RoundOutcome, RoundRecord};
use crate::sandbox::{Namespace, Sandbox};
use crate::tools::{NoExternalTools, ToolInvoker};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tinker_proto::{Event, EventBus, PipelinePayload, TaskId};
use tracing::{debug, info};

/// Protocol preamble sent as the system message of every task.
const SYSTEM_PROMPT: &str = "\
You are a coding assistant operating an execute-and-observe loop.
Act by replying with fenced code blocks; when the task is complete, reply \
with your final answer and no code blocks at all.

Rules:
- ```python blocks run in a persistent session: top-level variables defined \
in one round stay available in later rounds.
- ```bash blocks run as shell commands in the task working directory.
- Name a block by adding name=<identifier> after the language tag.
- To re-run or change a stored block, reply with a ```toolcall fence \
containing JSON such as {\"name\": \"exec\", \"arguments\": {\"name\": \"main\"}} \
or {\"name\": \"edit\", \"arguments\": {\"name\": \"main\", \"old\": \"...\", \"new\": \"...\"}}.
- After every round you receive the execution results (stdout, stderr, exit \
status) and continue from there.";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Cumulative counters for one task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub rounds: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub elapsed_ms: u64,
}

/// The persisted document describing one finished (or in-flight) task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub created: DateTime<Utc>,
    pub instruction: String,
    pub status: TaskStatus,
    /// Set when the task was force-completed by the round-count limit.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rounds: Vec<RoundRecord>,
    /// Best-effort snapshot of the namespace's top-level bindings.
    pub namespace: serde_json::Value,
    pub stats: TaskStats,
}

/// Cooperative cancellation flag, observed at round boundaries only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives one task from CREATED to a terminal state.
pub struct TaskController {
    id: TaskId,
    instruction: String,
    bus: Arc<EventBus>,
    client: Arc<dyn LlmClient>,
    invoker: Arc<dyn ToolInvoker>,
    installer: Arc<dyn DependencyInstaller>,
    sandbox: Sandbox,
    namespace: Namespace,
    blocks: BlockStore,
    history: Vec<ChatMessage>,
    cancel: CancelFlag,
    max_rounds: u32,
    max_round_retries: u32,
    stream: bool,
    created: DateTime<Utc>,
}

impl TaskController {
    pub fn new(
        id: TaskId,
        instruction: impl Into<String>,
        bus: Arc<EventBus>,
        client: Arc<dyn LlmClient>,
        sandbox: Sandbox,
    ) -> Self {
        Self {
            id,
            instruction: instruction.into(),
            bus,
            client,
            invoker: Arc::new(NoExternalTools),
            installer: Arc::new(NoInstaller),
            sandbox,
            namespace: Namespace::new(),
            blocks: BlockStore::new(),
            history: Vec::new(),
            cancel: CancelFlag::new(),
            max_rounds: crate::config::LoopConfig::default().max_rounds,
            max_round_retries: crate::config::LoopConfig::default().max_round_retries,
            stream: true,
            created: Utc::now(),
        }
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn ToolInvoker>) -> Self {
        self.invoker = invoker;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn DependencyInstaller>) -> Self {
        self.installer = installer;
        self
    }

    pub fn with_limits(mut self, max_rounds: u32, max_round_retries: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self.max_round_retries = max_round_retries;
        self
    }

    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Seeds the fresh namespace from a previous task's snapshot.
    /// This is the explicit opt-in resumption path; it never happens
    /// automatically.
    pub fn with_seed_namespace(mut self, namespace: Namespace) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Handle for requesting cooperative cancellation.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Runs the task to a terminal state and returns its record.
    ///
    /// Consumes the controller: terminal states are final.
    pub async fn run(mut self) -> TaskRecord {
        let timer = Instant::now();

        // Pipeline subscribers may rewrite the instruction before the LLM
        // ever sees it.
        let payload = self.bus.run_pipeline(PipelinePayload::Instruction {
            task_id: self.id.clone(),
            text: self.instruction.clone(),
        });
        let effective = match payload {
            PipelinePayload::Instruction { text, .. } => text,
            _ => self.instruction.clone(),
        };

        self.bus.publish(&Event::TaskStart {
            task_id: self.id.clone(),
            instruction: effective.clone(),
        });
        info!(task = %self.id, "Task started");

        self.history.push(ChatMessage::system(SYSTEM_PROMPT));
        let mut next_prompt = ChatMessage::user(effective);

        let mut rounds: Vec<RoundRecord> = Vec::new();
        let mut usage = Usage::default();
        let mut truncated = false;
        let mut error: Option<String> = None;

        let status = loop {
            // Cancellation is cooperative and only observed here, at the
            // round boundary; an in-flight round always runs to completion.
            if self.cancel.is_requested() {
                break TaskStatus::Cancelled;
            }

            let index = rounds.len() as u32 + 1;
            self.bus.publish(&Event::RoundStart {
                task_id: self.id.clone(),
                round: index,
            });

            let controller = RoundController {
                task_id: &self.id,
                bus: &self.bus,
                client: self.client.as_ref(),
                sandbox: &self.sandbox,
                invoker: self.invoker.as_ref(),
                installer: self.installer.as_ref(),
                max_retries: self.max_round_retries,
                stream: self.stream,
            };
            let record = controller
                .run(
                    index,
                    next_prompt.clone(),
                    &mut self.history,
                    &mut self.blocks,
                    &mut self.namespace,
                )
                .await;

            self.bus.publish(&Event::RoundEnd {
                task_id: self.id.clone(),
                round: index,
                outcome: record.outcome.as_str().to_string(),
            });

            usage.absorb(record.usage);
            let outcome = record.outcome;
            let round_error = record.error.clone();
            rounds.push(record);

            // Termination priority: cancellation, failure, final answer,
            // round-count limit.
            if self.cancel.is_requested() {
                break TaskStatus::Cancelled;
            }
            match outcome {
                RoundOutcome::Failed => {
                    error = round_error;
                    break TaskStatus::Error;
                }
                RoundOutcome::FinalAnswer => break TaskStatus::Done,
                RoundOutcome::Continue => {
                    if rounds.len() as u32 >= self.max_rounds {
                        debug!(task = %self.id, rounds = rounds.len(), "Round limit reached");
                        truncated = true;
                        break TaskStatus::Done;
                    }
                    next_prompt = round::feedback_message(rounds.last().unwrap());
                }
            }
        };

        self.bus.publish(&Event::TaskEnd {
            task_id: self.id.clone(),
            status: status.as_str().to_string(),
            rounds: rounds.len() as u32,
            truncated,
        });
        info!(
            task = %self.id,
            status = status.as_str(),
            rounds = rounds.len(),
            truncated,
            "Task finished"
        );

        let stats = TaskStats {
            rounds: rounds.len() as u32,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            elapsed_ms: timer.elapsed().as_millis() as u64,
        };

        TaskRecord {
            id: self.id,
            created: self.created,
            instruction: self.instruction,
            status,
            truncated,
            error,
            rounds,
            namespace: self.namespace.snapshot(),
            stats,
        }
    }
}
