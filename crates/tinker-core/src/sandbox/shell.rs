//! Shell runtime for `bash`/`sh` blocks.
//!
//! Shell blocks are stateless process executions: they share the task's
//! working directory but do not read or write the variable namespace.

use super::{ExecutionResult, LanguageRuntime, Namespace, SandboxError};
use crate::block::CodeBlock;
use async_trait::async_trait;
use std::path::Path;
use std::time::Instant;
use tokio::process::Command;

pub struct ShellRuntime {
    bin: String,
}

impl ShellRuntime {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl LanguageRuntime for ShellRuntime {
    fn language(&self) -> &'static str {
        "bash"
    }

    fn matches(&self, lang: &str) -> bool {
        matches!(lang, "bash" | "sh" | "shell")
    }

    async fn execute(
        &self,
        block: &CodeBlock,
        _namespace: &mut Namespace,
        workdir: &Path,
    ) -> Result<ExecutionResult, SandboxError> {
        let started = Instant::now();
        let output = Command::new(&self.bin)
            .arg("-c")
            .arg(&block.source)
            .current_dir(workdir)
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;

        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            duration_ms: started.elapsed().as_millis() as u64,
            exit_code: output.status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    #[cfg(unix)]
    async fn test_shell_captures_stdout() {
        let tmp = TempDir::new().unwrap();
        let runtime = ShellRuntime::new("bash");
        let mut ns = Namespace::new();
        let block = CodeBlock::new("main", "bash", "echo hello", 0);

        let result = runtime.execute(&block, &mut ns, tmp.path()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert!(ns.is_empty());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_shell_nonzero_exit_is_failure() {
        let tmp = TempDir::new().unwrap();
        let runtime = ShellRuntime::new("bash");
        let mut ns = Namespace::new();
        let block = CodeBlock::new("main", "bash", "echo oops >&2; exit 2", 0);

        let result = runtime.execute(&block, &mut ns, tmp.path()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.stderr, "oops\n");
    }

    #[test]
    fn test_matches_aliases() {
        let runtime = ShellRuntime::new("bash");
        assert!(runtime.matches("bash"));
        assert!(runtime.matches("sh"));
        assert!(runtime.matches("shell"));
        assert!(!runtime.matches("zsh"));
    }
}
