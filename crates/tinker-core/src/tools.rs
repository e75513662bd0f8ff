//! Tool-call directives and their dispatch.
//!
//! The parser extracts [`ToolCall`]s from `toolcall` fences; the round loop
//! dispatches them here. `edit` and `exec` are built in and operate on the
//! task's block store and sandbox; everything else goes to the external
//! [`ToolInvoker`] collaborator.

use crate::block::BlockStore;
use crate::sandbox::{ExecOutcome, Namespace, Sandbox};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Outcome of one dispatched tool call, fed back to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub success: bool,
    pub output: Value,
}

/// Failure from the external tool collaborator.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool `{0}`")]
    Unknown(String),
    #[error("invalid arguments for `{tool}`: {message}")]
    InvalidArgs { tool: String, message: String },
    #[error("tool `{tool}` failed: {message}")]
    Failed { tool: String, message: String },
}

/// External tool invocation boundary.
///
/// Implementations resolve tool names the core does not know about.
/// Errors are converted into failed [`ToolOutcome`]s, never propagated.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, name: &str, arguments: &Value) -> Result<Value, ToolError>;
}

/// Invoker used when no external tools are configured: every call fails
/// with `unknown tool`.
pub struct NoExternalTools;

#[async_trait]
impl ToolInvoker for NoExternalTools {
    async fn invoke(&self, name: &str, _arguments: &Value) -> Result<Value, ToolError> {
        Err(ToolError::Unknown(name.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct EditArgs {
    name: String,
    old: String,
    new: String,
    #[serde(default)]
    replace_all: bool,
}

#[derive(Debug, Deserialize)]
struct ExecArgs {
    name: String,
}

/// Dispatches tool calls in order, collecting one outcome per call.
///
/// `on_call`/`on_result` observe each dispatch (the round loop publishes
/// `tool_call`/`tool_result` events through them). An `exec` of a block
/// whose `edit` failed earlier in the same batch is skipped: running a
/// version the model believes it just changed would feed back misleading
/// results.
pub(crate) async fn dispatch(
    calls: &[ToolCall],
    blocks: &mut BlockStore,
    sandbox: &Sandbox,
    namespace: &mut Namespace,
    invoker: &dyn ToolInvoker,
    on_call: &(dyn Fn(&ToolCall) + Send + Sync),
    on_result: &(dyn Fn(&ToolOutcome) + Send + Sync),
) -> Vec<ToolOutcome> {
    let mut outcomes = Vec::with_capacity(calls.len());
    let mut failed_edits: Vec<String> = Vec::new();

    for call in calls {
        on_call(call);
        let outcome = match call.name.as_str() {
            "edit" => dispatch_edit(call, blocks, &mut failed_edits),
            "exec" => dispatch_exec(call, blocks, sandbox, namespace, &failed_edits).await,
            other => match invoker.invoke(other, &call.arguments).await {
                Ok(output) => ToolOutcome {
                    tool: call.name.clone(),
                    success: true,
                    output,
                },
                Err(e) => {
                    warn!(tool = other, error = %e, "External tool call failed");
                    failure(&call.name, e.to_string())
                }
            },
        };
        on_result(&outcome);
        outcomes.push(outcome);
    }
    outcomes
}

fn dispatch_edit(
    call: &ToolCall,
    blocks: &mut BlockStore,
    failed_edits: &mut Vec<String>,
) -> ToolOutcome {
    let args: EditArgs = match serde_json::from_value(call.arguments.clone()) {
        Ok(args) => args,
        Err(e) => return failure("edit", format!("invalid arguments: {e}")),
    };
    match blocks.edit(&args.name, &args.old, &args.new, args.replace_all) {
        Ok(block) => ToolOutcome {
            tool: "edit".into(),
            success: true,
            output: json!({ "block": block.name, "version": block.version }),
        },
        Err(e) => {
            failed_edits.push(args.name);
            failure("edit", e.to_string())
        }
    }
}

async fn dispatch_exec(
    call: &ToolCall,
    blocks: &BlockStore,
    sandbox: &Sandbox,
    namespace: &mut Namespace,
    failed_edits: &[String],
) -> ToolOutcome {
    let args: ExecArgs = match serde_json::from_value(call.arguments.clone()) {
        Ok(args) => args,
        Err(e) => return failure("exec", format!("invalid arguments: {e}")),
    };
    if failed_edits.iter().any(|name| name == &args.name) {
        return failure(
            "exec",
            format!("skipped: previous edit of block `{}` failed", args.name),
        );
    }
    let Some(block) = blocks.get(&args.name).cloned() else {
        return failure("exec", format!("no block named `{}`", args.name));
    };
    match sandbox.run(&block, namespace).await {
        Ok(ExecOutcome::Completed(result)) => ToolOutcome {
            tool: "exec".into(),
            success: result.success,
            output: serde_json::to_value(&result).unwrap_or(Value::Null),
        },
        Ok(ExecOutcome::NeedsDependencies { packages }) => failure(
            "exec",
            format!("missing dependencies: {}", packages.join(", ")),
        ),
        Err(e) => failure("exec", format!("sandbox failure: {e}")),
    }
}

fn failure(tool: &str, message: String) -> ToolOutcome {
    ToolOutcome {
        tool: tool.to_string(),
        success: false,
        output: json!({ "error": message }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::CodeBlock;
    use tempfile::TempDir;

    fn sandbox(tmp: &TempDir) -> Sandbox {
        // No runtimes registered: exec of any language reports unsupported.
        Sandbox::new(tmp.path().join("work"))
    }

    #[tokio::test]
    async fn test_edit_tool_bumps_version() {
        let tmp = TempDir::new().unwrap();
        let sandbox = sandbox(&tmp);
        let mut blocks = BlockStore::new();
        let mut ns = Namespace::new();
        blocks.add(CodeBlock::new("calc", "python", "x = 1", 0));

        let calls = vec![ToolCall {
            name: "edit".into(),
            arguments: json!({ "name": "calc", "old": "x = 1", "new": "x = 2" }),
        }];
        let outcomes = dispatch(&calls, &mut blocks, &sandbox, &mut ns, &NoExternalTools, &|_| {}, &|_| {}).await;

        assert!(outcomes[0].success);
        assert_eq!(outcomes[0].output["version"], 2);
        assert_eq!(blocks.get("calc").unwrap().source, "x = 2");
    }

    #[tokio::test]
    async fn test_exec_skipped_after_failed_edit() {
        let tmp = TempDir::new().unwrap();
        let sandbox = sandbox(&tmp);
        let mut blocks = BlockStore::new();
        let mut ns = Namespace::new();
        blocks.add(CodeBlock::new("calc", "python", "x = 1", 0));

        let calls = vec![
            ToolCall {
                name: "edit".into(),
                arguments: json!({ "name": "calc", "old": "missing", "new": "y" }),
            },
            ToolCall {
                name: "exec".into(),
                arguments: json!({ "name": "calc" }),
            },
        ];
        let outcomes = dispatch(&calls, &mut blocks, &sandbox, &mut ns, &NoExternalTools, &|_| {}, &|_| {}).await;

        assert!(!outcomes[0].success);
        assert!(!outcomes[1].success);
        let detail = outcomes[1].output["error"].as_str().unwrap();
        assert!(detail.contains("previous edit"), "got: {detail}");
    }

    #[tokio::test]
    async fn test_unknown_tool_goes_to_invoker() {
        let tmp = TempDir::new().unwrap();
        let sandbox = sandbox(&tmp);
        let mut blocks = BlockStore::new();
        let mut ns = Namespace::new();

        let calls = vec![ToolCall {
            name: "browser".into(),
            arguments: json!({ "url": "https://example.com" }),
        }];
        let outcomes = dispatch(&calls, &mut blocks, &sandbox, &mut ns, &NoExternalTools, &|_| {}, &|_| {}).await;

        assert!(!outcomes[0].success);
        assert!(
            outcomes[0].output["error"]
                .as_str()
                .unwrap()
                .contains("unknown tool")
        );
    }

    #[tokio::test]
    async fn test_exec_unknown_block() {
        let tmp = TempDir::new().unwrap();
        let sandbox = sandbox(&tmp);
        let mut blocks = BlockStore::new();
        let mut ns = Namespace::new();

        let calls = vec![ToolCall {
            name: "exec".into(),
            arguments: json!({ "name": "ghost" }),
        }];
        let outcomes = dispatch(&calls, &mut blocks, &sandbox, &mut ns, &NoExternalTools, &|_| {}, &|_| {}).await;
        assert!(!outcomes[0].success);
    }
}
