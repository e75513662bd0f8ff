//! End-to-end scenarios for the round loop, driven by a scripted LLM and an
//! in-memory language runtime so no interpreter is needed.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tinker_core::testing::{CollectingSubscriber, ScriptedClient};
use tinker_core::{
    CodeBlock, DependencyInstaller, ExecutionResult, InstallError, LanguageRuntime, LlmError,
    Namespace, RoundOutcome, Sandbox, SandboxError, TaskController, TaskStatus,
};
use tinker_proto::{Event, EventBus, TaskId};

/// Interprets a tiny command language instead of real Python:
/// - `print <text>`  -> writes `<text>\n` to stdout
/// - `set <name> <json>` -> binds a namespace variable
/// - `get <name>` -> prints the bound value
/// - `fail` -> unsuccessful result with a traceback-ish stderr
/// - `import <module>` -> reports the module as a missing dependency
struct MiniRuntime;

#[async_trait]
impl LanguageRuntime for MiniRuntime {
    fn language(&self) -> &'static str {
        "python"
    }

    async fn check_dependencies(&self, block: &CodeBlock) -> Result<Vec<String>, SandboxError> {
        Ok(block
            .source
            .lines()
            .filter_map(|line| line.strip_prefix("import "))
            .map(|m| m.trim().to_string())
            .collect())
    }

    async fn execute(
        &self,
        block: &CodeBlock,
        namespace: &mut Namespace,
        _workdir: &Path,
    ) -> Result<ExecutionResult, SandboxError> {
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut success = true;
        for line in block.source.lines() {
            if let Some(text) = line.strip_prefix("print ") {
                stdout.push_str(text);
                stdout.push('\n');
            } else if let Some(rest) = line.strip_prefix("set ") {
                let (name, value) = rest.split_once(' ').unwrap_or((rest, "null"));
                let value = serde_json::from_str(value).unwrap_or(serde_json::Value::Null);
                namespace.bind(name, value);
            } else if let Some(name) = line.strip_prefix("get ") {
                match namespace.get(name.trim()) {
                    Some(value) => {
                        stdout.push_str(&value.to_string());
                        stdout.push('\n');
                    }
                    None => {
                        stderr.push_str(&format!("NameError: {name} is not defined\n"));
                        success = false;
                    }
                }
            } else if line.trim() == "fail" {
                stderr.push_str("Traceback (most recent call last):\nRuntimeError: boom\n");
                success = false;
            }
        }
        Ok(ExecutionResult {
            stdout,
            stderr,
            success,
            duration_ms: 1,
            exit_code: Some(i32::from(!success)),
        })
    }
}

struct OkInstaller;

#[async_trait]
impl DependencyInstaller for OkInstaller {
    async fn install(&self, _packages: &[String]) -> Result<(), InstallError> {
        Ok(())
    }
}

fn controller(
    tmp: &TempDir,
    bus: &Arc<EventBus>,
    client: Arc<ScriptedClient>,
    instruction: &str,
) -> TaskController {
    let mut sandbox = Sandbox::new(tmp.path().join("work"));
    sandbox.register(Box::new(MiniRuntime));
    TaskController::new(
        TaskId::generate(),
        instruction,
        bus.clone(),
        client,
        sandbox,
    )
}

#[tokio::test]
async fn completes_after_code_round_then_final_answer() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let collector = CollectingSubscriber::new();
    collector.attach(&bus);

    let client = Arc::new(ScriptedClient::new());
    client.push_reply("Computing.\n```python\nprint 2\n```");
    client.push_reply("The answer is 2.");

    let record = controller(&tmp, &bus, client.clone(), "print 1+1")
        .run()
        .await;

    assert_eq!(record.status, TaskStatus::Done);
    assert!(!record.truncated);
    assert_eq!(record.rounds.len(), 2);
    assert_eq!(record.rounds[0].outcome, RoundOutcome::Continue);
    assert_eq!(record.rounds[1].outcome, RoundOutcome::FinalAnswer);

    let exec = &record.rounds[0].executions[0];
    assert_eq!(exec.result.stdout, "2\n");
    assert!(exec.result.success);
    assert_eq!(record.rounds[1].commentary, "The answer is 2.");
    assert_eq!(client.remaining(), 0);

    let names = collector.names();
    assert_eq!(names.first(), Some(&"task_start"));
    assert_eq!(names.last(), Some(&"task_end"));
    assert!(names.contains(&"exec_start"));
    assert!(names.contains(&"exec_result"));
}

#[tokio::test]
async fn round_indices_are_monotonic_without_gaps() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    for i in 0..5 {
        client.push_reply(format!("```python\nprint {i}\n```"));
    }

    let record = controller(&tmp, &bus, client, "count")
        .with_limits(4, 1)
        .run()
        .await;

    let indices: Vec<u32> = record.rounds.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn namespace_persists_across_rounds() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_reply("```python\nset total 41\n```");
    client.push_reply("```python\nget total\n```");
    client.push_reply("Done.");

    let record = controller(&tmp, &bus, client, "remember things")
        .run()
        .await;

    assert_eq!(record.status, TaskStatus::Done);
    assert_eq!(record.rounds[1].executions[0].result.stdout, "41\n");
    assert_eq!(record.namespace["total"], 41);
}

#[tokio::test]
async fn execution_failure_is_feedback_not_task_failure() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_reply("```python\nfail\n```");
    client.push_reply("I see the error; giving up politely.");

    let record = controller(&tmp, &bus, client, "blow up").run().await;

    assert_eq!(record.status, TaskStatus::Done);
    let exec = &record.rounds[0].executions[0];
    assert!(!exec.result.success);
    assert!(exec.result.stderr.contains("RuntimeError"));
    // The failure is serialized into the next round's prompt.
    assert!(record.rounds[1].prompt.contains("RuntimeError"));
}

#[tokio::test]
async fn dependency_declined_without_approver() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_reply("```python\nimport pandas\n```");
    client.push_reply("Understood, no pandas.");

    let record = controller(&tmp, &bus, client, "need pandas").run().await;

    assert_eq!(record.status, TaskStatus::Done);
    let exec = &record.rounds[0].executions[0];
    assert!(!exec.result.success);
    assert!(exec.result.stderr.contains("dependency declined: pandas"));
    // A decline does not consume the retry budget: nothing was retried.
    assert_eq!(record.rounds[0].retries, 0);
    assert!(record.rounds[1].prompt.contains("dependency declined"));
}

#[tokio::test]
async fn repeated_dependency_signal_fails_the_round() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    // Approve every install; the runtime keeps reporting the module as
    // missing, so the retry budget runs out.
    bus.subscribe_pipeline("approve-all", |payload| match payload {
        tinker_proto::PipelinePayload::InstallRequest {
            task_id, packages, ..
        } => tinker_proto::PipelinePayload::InstallRequest {
            task_id,
            packages,
            approved: true,
        },
        other => other,
    });
    let client = Arc::new(ScriptedClient::new());
    client.push_reply("```python\nimport unobtainium\n```");

    let record = controller(&tmp, &bus, client, "install forever")
        .with_installer(Arc::new(OkInstaller))
        .with_limits(16, 1)
        .run()
        .await;

    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.rounds.len(), 1);
    assert_eq!(record.rounds[0].outcome, RoundOutcome::Failed);
    assert!(record.error.unwrap().contains("retry budget"));
}

#[tokio::test]
async fn round_limit_truncates_task() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    for _ in 0..5 {
        client.push_reply("```python\nprint again\n```");
    }

    let record = controller(&tmp, &bus, client.clone(), "never stop")
        .with_limits(3, 1)
        .run()
        .await;

    assert_eq!(record.status, TaskStatus::Done);
    assert!(record.truncated);
    assert_eq!(record.rounds.len(), 3);
    // Round 4 never queried the LLM.
    assert_eq!(client.remaining(), 2);
}

#[tokio::test]
async fn llm_error_fails_the_task() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_error(LlmError::Transient("connection reset".into()));

    let record = controller(&tmp, &bus, client, "doomed").run().await;

    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.rounds.len(), 1);
    assert_eq!(record.rounds[0].outcome, RoundOutcome::Failed);
    assert!(record.error.unwrap().contains("connection reset"));
}

#[tokio::test]
async fn cancellation_during_execution_takes_effect_at_round_boundary() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    let client = Arc::new(ScriptedClient::new());
    client.push_reply("```python\nprint one\n```");
    client.push_reply("```python\nprint two\n```");
    client.push_reply("```python\nprint three\n```");

    let task = controller(&tmp, &bus, client.clone(), "cancel me");
    let cancel = task.cancel_flag();

    // Request cancellation from inside round 2's EXECUTING phase.
    bus.subscribe("canceller", move |event| {
        if let Event::ExecStart { round: 2, .. } = event {
            cancel.request();
        }
    });

    let record = task.run().await;

    assert_eq!(record.status, TaskStatus::Cancelled);
    // Round 2 ran to completion before the flag took effect.
    assert_eq!(record.rounds.len(), 2);
    assert_eq!(record.rounds[1].executions[0].result.stdout, "two\n");
    // Round 3 never started.
    assert_eq!(client.remaining(), 1);
}

#[tokio::test]
async fn concurrent_tasks_have_isolated_namespaces() {
    let tmp_a = TempDir::new().unwrap();
    let tmp_b = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());

    let client_a = Arc::new(ScriptedClient::new());
    client_a.push_reply("```python\nset marker \"alpha\"\n```");
    client_a.push_reply("Done.");
    let client_b = Arc::new(ScriptedClient::new());
    client_b.push_reply("```python\nset marker \"beta\"\n```");
    client_b.push_reply("Done.");

    let task_a = controller(&tmp_a, &bus, client_a, "mark a");
    let task_b = controller(&tmp_b, &bus, client_b, "mark b");

    let (record_a, record_b) = tokio::join!(task_a.run(), task_b.run());

    assert_eq!(record_a.namespace["marker"], "alpha");
    assert_eq!(record_b.namespace["marker"], "beta");
}

#[tokio::test]
async fn instruction_pipeline_rewrites_before_first_query() {
    let tmp = TempDir::new().unwrap();
    let bus = Arc::new(EventBus::new());
    bus.subscribe_pipeline("rewriter", |payload| match payload {
        tinker_proto::PipelinePayload::Instruction { task_id, text } => {
            tinker_proto::PipelinePayload::Instruction {
                task_id,
                text: format!("{text} (be brief)"),
            }
        }
        other => other,
    });

    let client = Arc::new(ScriptedClient::new());
    client.push_reply("Short answer.");

    let record = controller(&tmp, &bus, client, "explain monads").run().await;

    assert_eq!(record.status, TaskStatus::Done);
    // The rewritten instruction is what round 1 sent.
    assert!(record.rounds[0].prompt.contains("(be brief)"));
    // The original instruction is preserved on the record.
    assert_eq!(record.instruction, "explain monads");
}
