//! One query/parse/execute/feedback cycle.
//!
//! The round controller walks QUERYING -> PARSING -> EXECUTING -> FEEDBACK,
//! recording everything into a [`RoundRecord`] that the task controller
//! appends to the task history. Code-execution failures are normal feedback
//! and keep the round alive; only LLM connection errors, sandbox
//! infrastructure faults, and an exhausted dependency-retry budget fail a
//! round.

use crate::block::{BlockStore, CodeBlock};
use crate::install::DependencyInstaller;
use crate::llm::{ChatMessage, LlmClient, Usage};
use crate::parser::{self, ParseWarning};
use crate::sandbox::{ExecOutcome, ExecutionResult, Namespace, Sandbox};
use crate::tools::{ToolInvoker, ToolOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use tinker_proto::{Event, EventBus, PipelinePayload, TaskId};
use tracing::{debug, warn};

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundOutcome {
    /// Code or tool calls ran; results feed the next round.
    Continue,
    /// The reply contained nothing to execute: the task is answered.
    FinalAnswer,
    /// LLM connection error, sandbox infrastructure fault, or retry
    /// budget exhaustion.
    Failed,
}

impl RoundOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RoundOutcome::Continue => "continue",
            RoundOutcome::FinalAnswer => "final_answer",
            RoundOutcome::Failed => "failed",
        }
    }
}

/// One executed block and its result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockExecution {
    pub block: String,
    pub lang: String,
    pub version: u32,
    pub result: ExecutionResult,
}

/// Immutable record of one closed round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    /// 1-based, strictly increasing within a task.
    pub index: u32,
    pub prompt: String,
    pub reply: String,
    pub commentary: String,
    pub warnings: Vec<ParseWarning>,
    pub executions: Vec<BlockExecution>,
    pub tool_outcomes: Vec<ToolOutcome>,
    /// Dependency-install retries consumed in this round.
    pub retries: u32,
    pub outcome: RoundOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: Usage,
    pub started: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Runs rounds for one task. Borrowed, not owned: the task controller holds
/// all the long-lived state.
pub(crate) struct RoundController<'a> {
    pub task_id: &'a TaskId,
    pub bus: &'a EventBus,
    pub client: &'a dyn LlmClient,
    pub sandbox: &'a Sandbox,
    pub invoker: &'a dyn ToolInvoker,
    pub installer: &'a dyn DependencyInstaller,
    pub max_retries: u32,
    pub stream: bool,
}

impl RoundController<'_> {
    /// Runs one round. Never returns an error: every failure mode is
    /// folded into the record's outcome.
    pub async fn run(
        &self,
        index: u32,
        prompt: ChatMessage,
        history: &mut Vec<ChatMessage>,
        blocks: &mut BlockStore,
        namespace: &mut Namespace,
    ) -> RoundRecord {
        let timer = Instant::now();
        let mut record = RoundRecord {
            index,
            prompt: prompt.content.clone(),
            reply: String::new(),
            commentary: String::new(),
            warnings: Vec::new(),
            executions: Vec::new(),
            tool_outcomes: Vec::new(),
            retries: 0,
            outcome: RoundOutcome::Continue,
            error: None,
            usage: Usage::default(),
            started: Utc::now(),
            duration_ms: 0,
        };

        history.push(prompt);
        self.run_phases(&mut record, history, blocks, namespace)
            .await;
        record.duration_ms = timer.elapsed().as_millis() as u64;
        record
    }

    async fn run_phases(
        &self,
        record: &mut RoundRecord,
        history: &mut Vec<ChatMessage>,
        blocks: &mut BlockStore,
        namespace: &mut Namespace,
    ) {
        // QUERYING
        self.bus.publish(&Event::QueryStart {
            task_id: self.task_id.clone(),
            round: record.index,
            llm: self.client.name().to_string(),
        });

        let reply = if self.stream {
            let bus = self.bus;
            let task_id = self.task_id.clone();
            self.client
                .send_streaming(history, &move |chunk: &str| {
                    bus.publish(&Event::Stream {
                        task_id: task_id.clone(),
                        chunk: chunk.to_string(),
                    });
                })
                .await
        } else {
            self.client.send(history).await
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                warn!(round = record.index, error = %e, "LLM query failed");
                record.outcome = RoundOutcome::Failed;
                record.error = Some(e.to_string());
                return;
            }
        };

        self.bus.publish(&Event::QueryEnd {
            task_id: self.task_id.clone(),
            round: record.index,
            input_tokens: reply.usage.input_tokens,
            output_tokens: reply.usage.output_tokens,
        });
        record.usage = reply.usage;
        record.reply = reply.text.clone();
        history.push(ChatMessage::assistant(&reply.text));

        // PARSING
        let parsed = parser::parse(&reply.text);
        for warning in &parsed.warnings {
            warn!(round = record.index, %warning, "Parse warning");
        }
        record.commentary = parsed.commentary;
        record.warnings = parsed.warnings;

        if parsed.blocks.is_empty() && parsed.tool_calls.is_empty() {
            debug!(round = record.index, "No code or tool calls: final answer");
            record.outcome = RoundOutcome::FinalAnswer;
            return;
        }

        // EXECUTING: blocks first, in reply order.
        for block in parsed.blocks {
            let stored = blocks.add(block).clone();
            self.bus.publish(&Event::ExecStart {
                task_id: self.task_id.clone(),
                round: record.index,
                block: stored.name.clone(),
                lang: stored.lang.clone(),
            });

            match self.execute_block(&stored, namespace, record).await {
                Ok(result) => {
                    self.bus.publish(&Event::ExecResult {
                        task_id: self.task_id.clone(),
                        round: record.index,
                        block: stored.name.clone(),
                        success: result.success,
                        duration_ms: result.duration_ms,
                    });
                    record.executions.push(BlockExecution {
                        block: stored.name.clone(),
                        lang: stored.lang.clone(),
                        version: stored.version,
                        result,
                    });
                }
                Err(reason) => {
                    record.outcome = RoundOutcome::Failed;
                    record.error = Some(reason);
                    return;
                }
            }
        }

        // Tool-call directives, in reply order.
        if !parsed.tool_calls.is_empty() {
            let task_id = self.task_id;
            let round = record.index;
            let bus = self.bus;
            let outcomes = crate::tools::dispatch(
                &parsed.tool_calls,
                blocks,
                self.sandbox,
                namespace,
                self.invoker,
                &|call| {
                    bus.publish(&Event::ToolCall {
                        task_id: task_id.clone(),
                        round,
                        tool: call.name.clone(),
                    });
                },
                &|outcome| {
                    bus.publish(&Event::ToolResult {
                        task_id: task_id.clone(),
                        round,
                        tool: outcome.tool.clone(),
                        success: outcome.success,
                    });
                },
            )
            .await;
            record.tool_outcomes = outcomes;
        }

        // FEEDBACK happens in the task controller: the record is turned
        // into the next round's prompt by `feedback_message`.
    }

    /// Runs one block through the sandbox, handling the dependency-install
    /// flow. `Err` carries a round-fatal reason.
    async fn execute_block(
        &self,
        block: &CodeBlock,
        namespace: &mut Namespace,
        record: &mut RoundRecord,
    ) -> Result<ExecutionResult, String> {
        loop {
            let outcome = match self.sandbox.run(block, namespace).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.bus.publish(&Event::Exception {
                        task_id: self.task_id.clone(),
                        context: "sandbox".to_string(),
                        message: e.to_string(),
                    });
                    return Err(format!("sandbox failure: {e}"));
                }
            };

            match outcome {
                ExecOutcome::Completed(result) => return Ok(result),
                ExecOutcome::NeedsDependencies { packages } => {
                    if record.retries >= self.max_retries {
                        return Err(format!(
                            "dependency retry budget exhausted for block `{}` (needs {})",
                            block.name,
                            packages.join(", ")
                        ));
                    }

                    let payload = self.bus.run_pipeline(PipelinePayload::InstallRequest {
                        task_id: self.task_id.clone(),
                        packages: packages.clone(),
                        approved: false,
                    });
                    let (approved, packages) = match payload {
                        PipelinePayload::InstallRequest {
                            approved, packages, ..
                        } => (approved, packages),
                        _ => (false, packages),
                    };

                    if !approved {
                        debug!(block = %block.name, "Dependency install declined");
                        return Ok(ExecutionResult::rejected(format!(
                            "dependency declined: {}",
                            packages.join(", ")
                        )));
                    }

                    match self.installer.install(&packages).await {
                        Ok(()) => {
                            // The retry of the EXECUTING phase is what counts
                            // against the per-round budget; a decline returns
                            // without retrying.
                            record.retries += 1;
                            debug!(block = %block.name, ?packages, "Dependencies installed; retrying block");
                        }
                        Err(e) => {
                            return Ok(ExecutionResult::rejected(format!(
                                "dependency install failed: {e}"
                            )));
                        }
                    }
                }
            }
        }
    }
}

/// Builds the feedback message carrying a round's results into the next
/// round's QUERYING phase.
pub(crate) fn feedback_message(record: &RoundRecord) -> ChatMessage {
    let results: Vec<_> = record
        .executions
        .iter()
        .map(|exec| {
            json!({
                "block": exec.block,
                "lang": exec.lang,
                "success": exec.result.success,
                "stdout": exec.result.stdout,
                "stderr": exec.result.stderr,
                "exit_code": exec.result.exit_code,
            })
        })
        .collect();
    let tool_results: Vec<_> = record
        .tool_outcomes
        .iter()
        .map(|outcome| {
            json!({
                "tool": outcome.tool,
                "success": outcome.success,
                "output": outcome.output,
            })
        })
        .collect();
    let warnings: Vec<String> = record.warnings.iter().map(ToString::to_string).collect();

    let report = json!({
        "results": results,
        "tool_results": tool_results,
        "parse_warnings": warnings,
    });
    let body = serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string());

    ChatMessage::user(format!(
        "Execution results:\n```json\n{body}\n```\nContinue the task based on these results. \
         When the task is complete, reply without any code blocks."
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_strings() {
        assert_eq!(RoundOutcome::Continue.as_str(), "continue");
        assert_eq!(RoundOutcome::FinalAnswer.as_str(), "final_answer");
        assert_eq!(RoundOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn test_feedback_message_carries_results() {
        let record = RoundRecord {
            index: 1,
            prompt: "p".into(),
            reply: "r".into(),
            commentary: String::new(),
            warnings: Vec::new(),
            executions: vec![BlockExecution {
                block: "main".into(),
                lang: "python".into(),
                version: 1,
                result: ExecutionResult {
                    stdout: "2\n".into(),
                    stderr: String::new(),
                    success: true,
                    duration_ms: 3,
                    exit_code: Some(0),
                },
            }],
            tool_outcomes: Vec::new(),
            retries: 0,
            outcome: RoundOutcome::Continue,
            error: None,
            usage: Usage::default(),
            started: Utc::now(),
            duration_ms: 3,
        };

        let msg = feedback_message(&record);
        assert!(msg.content.contains("\"block\": \"main\""));
        assert!(msg.content.contains("\"stdout\": \"2\\n\""));
        assert!(msg.content.contains("reply without any code blocks"));
    }
}
