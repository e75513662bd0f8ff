//! Configuration types for the Tinker task loop.
//!
//! Loading from a file is the CLI's job; this module only defines the
//! structure. Every section and field has a default so a missing or partial
//! config document still produces a working setup.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TinkerConfig {
    /// Round loop limits.
    #[serde(default, rename = "loop")]
    pub round_loop: LoopConfig,

    /// LLM connection settings consumed by the adapter.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Code execution sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Persistence settings.
    #[serde(default)]
    pub store: StoreConfig,
}

/// Limits for the round loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Maximum rounds per task before the task is force-completed
    /// with the truncation flag.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Maximum dependency-install retries within one round.
    #[serde(default = "default_max_round_retries")]
    pub max_round_retries: u32,

    /// Maximum tasks in the RUNNING state at once; excess submissions queue.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            max_round_retries: default_max_round_retries(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

/// LLM connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model name sent with each request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Whether to request streamed responses.
    #[serde(default = "default_true")]
    pub stream: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            stream: true,
        }
    }
}

/// Sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Python interpreter used for `python` blocks.
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    /// Shell used for `bash`/`sh` blocks.
    #[serde(default = "default_shell_bin")]
    pub shell_bin: String,

    /// Working directory for executed code. Defaults to a per-task
    /// directory under the state dir.
    #[serde(default)]
    pub workdir: Option<PathBuf>,

    /// Approve dependency installs without asking. When false, installs are
    /// approved only if a pipeline subscriber grants them.
    #[serde(default)]
    pub auto_approve_installs: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python_bin: default_python_bin(),
            shell_bin: default_shell_bin(),
            workdir: None,
            auto_approve_installs: false,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding task documents and the event log.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

fn default_max_rounds() -> u32 {
    16
}

fn default_max_round_retries() -> u32 {
    1
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_shell_bin() -> String {
    "bash".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".tinker")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TinkerConfig::default();
        assert_eq!(config.round_loop.max_rounds, 16);
        assert_eq!(config.round_loop.max_round_retries, 1);
        assert_eq!(config.round_loop.max_concurrent_tasks, 4);
        assert_eq!(config.sandbox.python_bin, "python3");
        assert!(!config.sandbox.auto_approve_installs);
        assert_eq!(config.store.state_dir, PathBuf::from(".tinker"));
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let json = r#"{"loop": {"max_rounds": 3}, "llm": {"model": "local"}}"#;
        let config: TinkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.round_loop.max_rounds, 3);
        assert_eq!(config.round_loop.max_concurrent_tasks, 4);
        assert_eq!(config.llm.model, "local");
        assert_eq!(config.llm.timeout_secs, 120);
    }
}
