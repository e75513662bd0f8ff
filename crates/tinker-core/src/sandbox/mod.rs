//! Code execution sandbox.
//!
//! Executes one code block at a time against the task's persistent
//! namespace, converting every runtime failure of the executed code into a
//! structured [`ExecutionResult`]. Only infrastructure faults - a missing
//! interpreter, an unusable workdir, corrupted namespace state - surface as
//! [`SandboxError`] and terminate the task.
//!
//! Side effects of executed code on the host are intentionally NOT
//! contained: blocks run with full host privileges. The sandbox's isolation
//! is limited to keeping the host process alive and observing results.

mod namespace;
mod python;
mod shell;

pub use namespace::Namespace;
pub use python::PythonRuntime;
pub use shell::ShellRuntime;

use crate::block::CodeBlock;
use crate::config::SandboxConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Outcome of running one code block.
///
/// `stdout` and `stderr` are both always present; on success `stderr` is
/// usually empty, on failure it carries the traceback or error text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
    /// Process exit code when the runtime ran a process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ExecutionResult {
    /// A failure produced by the sandbox itself rather than executed code
    /// (unsupported language, declined install, exhausted retries).
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason.into(),
            success: false,
            duration_ms: 0,
            exit_code: None,
        }
    }
}

/// What the sandbox decided about a block.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    /// The block ran (successfully or not).
    Completed(ExecutionResult),
    /// The block needs packages that are not available. Nothing was
    /// executed; the caller decides whether to install and retry.
    NeedsDependencies { packages: Vec<String> },
}

/// Infrastructure failure: the sandbox itself cannot do its job.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox workdir unusable: {0}")]
    Workdir(#[source] std::io::Error),
    #[error("failed to run `{bin}`: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("namespace state corrupted: {0}")]
    StateCorrupted(String),
}

/// A per-language execution backend.
#[async_trait]
pub trait LanguageRuntime: Send + Sync {
    /// Primary language tag this runtime handles.
    fn language(&self) -> &'static str;

    /// Whether this runtime handles the given (lowercased) tag.
    fn matches(&self, lang: &str) -> bool {
        lang == self.language()
    }

    /// Returns packages the block needs but that are unavailable.
    /// Runtimes without dependency tracking return an empty list.
    async fn check_dependencies(&self, _block: &CodeBlock) -> Result<Vec<String>, SandboxError> {
        Ok(Vec::new())
    }

    /// Executes the block against the namespace in the given workdir.
    async fn execute(
        &self,
        block: &CodeBlock,
        namespace: &mut Namespace,
        workdir: &Path,
    ) -> Result<ExecutionResult, SandboxError>;
}

/// Dispatches blocks to language runtimes.
pub struct Sandbox {
    runtimes: Vec<Box<dyn LanguageRuntime>>,
    workdir: PathBuf,
}

impl Sandbox {
    /// Creates an empty sandbox rooted at `workdir`. Blocks of any language
    /// are reported unsupported until runtimes are registered.
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            runtimes: Vec::new(),
            workdir: workdir.into(),
        }
    }

    /// Creates a sandbox with the Python and shell runtimes from config.
    pub fn with_default_runtimes(workdir: impl Into<PathBuf>, config: &SandboxConfig) -> Self {
        let mut sandbox = Self::new(workdir);
        sandbox.register(Box::new(PythonRuntime::new(&config.python_bin)));
        sandbox.register(Box::new(ShellRuntime::new(&config.shell_bin)));
        sandbox
    }

    /// Registers a runtime. Later registrations do not shadow earlier ones:
    /// the first runtime matching a language wins.
    pub fn register(&mut self, runtime: Box<dyn LanguageRuntime>) {
        debug!(language = runtime.language(), "Registered language runtime");
        self.runtimes.push(runtime);
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn runtime_for(&self, lang: &str) -> Option<&dyn LanguageRuntime> {
        self.runtimes
            .iter()
            .find(|rt| rt.matches(lang))
            .map(|rt| rt.as_ref())
    }

    /// Runs one block.
    ///
    /// Returns `NeedsDependencies` without executing when the runtime's
    /// pre-check finds missing packages. An unsupported language yields a
    /// failed result, not an error - the loop continues and the LLM is told.
    pub async fn run(
        &self,
        block: &CodeBlock,
        namespace: &mut Namespace,
    ) -> Result<ExecOutcome, SandboxError> {
        std::fs::create_dir_all(&self.workdir).map_err(SandboxError::Workdir)?;

        let Some(runtime) = self.runtime_for(&block.lang) else {
            warn!(block = %block.name, lang = %block.lang, "No runtime for language");
            return Ok(ExecOutcome::Completed(ExecutionResult::rejected(format!(
                "unsupported language `{}`",
                block.lang
            ))));
        };

        let missing = runtime.check_dependencies(block).await?;
        if !missing.is_empty() {
            debug!(block = %block.name, packages = ?missing, "Block needs dependencies");
            return Ok(ExecOutcome::NeedsDependencies { packages: missing });
        }

        let result = runtime.execute(block, namespace, &self.workdir).await?;
        debug!(
            block = %block.name,
            success = result.success,
            duration_ms = result.duration_ms,
            "Block executed"
        );
        Ok(ExecOutcome::Completed(result))
    }
}
