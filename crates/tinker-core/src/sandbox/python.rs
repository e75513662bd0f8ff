//! Python runtime with a persistent, JSON-backed namespace.
//!
//! Each block runs in a fresh interpreter process under a small driver
//! (embedded at compile time) that injects the task's namespace bindings
//! before the block executes and captures the JSON-serializable top-level
//! bindings afterwards. The effect is an interactive-session feel: a later
//! block sees the variables an earlier block defined, without keeping an
//! interpreter resident in the host process.
//!
//! Before executing, the runtime scans the block's top-level imports and
//! probes their availability, so a missing third-party package surfaces as
//! a structured dependency signal instead of an ImportError traceback.

use super::{ExecutionResult, LanguageRuntime, Namespace, SandboxError};
use crate::block::CodeBlock;
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

const DRIVER: &str = include_str!("../../data/python_driver.py");

const PROBE: &str = r"
import importlib.util, sys
for mod in sys.argv[1:]:
    try:
        spec = importlib.util.find_spec(mod)
    except (ImportError, ValueError):
        spec = None
    if spec is None:
        print(mod)
";

pub struct PythonRuntime {
    bin: String,
}

impl PythonRuntime {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Probes which of the block's imports cannot be resolved, mapped to
    /// installable package names.
    async fn missing_packages(&self, source: &str) -> Result<Vec<String>, SandboxError> {
        let modules = extract_imports(source);
        if modules.is_empty() {
            return Ok(Vec::new());
        }

        let output = Command::new(&self.bin)
            .arg("-c")
            .arg(PROBE)
            .args(&modules)
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;

        if !output.status.success() {
            // A broken probe must not block execution; the block itself
            // will surface whatever is actually wrong.
            warn!(
                status = ?output.status.code(),
                "Dependency probe failed; assuming imports resolve"
            );
            return Ok(Vec::new());
        }

        let mut packages: Vec<String> = Vec::new();
        for module in String::from_utf8_lossy(&output.stdout).lines() {
            let module = module.trim();
            if module.is_empty() {
                continue;
            }
            let package = module_to_package(module).to_string();
            if !packages.contains(&package) {
                packages.push(package);
            }
        }
        Ok(packages)
    }
}

#[async_trait]
impl LanguageRuntime for PythonRuntime {
    fn language(&self) -> &'static str {
        "python"
    }

    fn matches(&self, lang: &str) -> bool {
        matches!(lang, "python" | "py" | "python3")
    }

    async fn check_dependencies(&self, block: &CodeBlock) -> Result<Vec<String>, SandboxError> {
        self.missing_packages(&block.source).await
    }

    async fn execute(
        &self,
        block: &CodeBlock,
        namespace: &mut Namespace,
        workdir: &Path,
    ) -> Result<ExecutionResult, SandboxError> {
        let scratch = tempfile::Builder::new()
            .prefix("tinker-py-")
            .tempdir()
            .map_err(SandboxError::Workdir)?;

        let code_path = scratch.path().join(format!("{}.py", file_stem(&block.name)));
        let driver_path = scratch.path().join("driver.py");
        let state_path = scratch.path().join("state.json");

        std::fs::write(&code_path, &block.source).map_err(SandboxError::Workdir)?;
        std::fs::write(&driver_path, DRIVER).map_err(SandboxError::Workdir)?;
        let snapshot =
            serde_json::to_string(&namespace.snapshot()).map_err(|e| SandboxError::StateCorrupted(e.to_string()))?;
        std::fs::write(&state_path, snapshot).map_err(SandboxError::Workdir)?;

        let started = Instant::now();
        let output = Command::new(&self.bin)
            .arg(&driver_path)
            .arg(&code_path)
            .env("TINKER_STATE_FILE", &state_path)
            .current_dir(workdir)
            .output()
            .await
            .map_err(|source| SandboxError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        // The driver rewrites the state file even on failure; a file we
        // cannot parse back means the namespace round-trip is broken.
        let state_text =
            std::fs::read_to_string(&state_path).map_err(SandboxError::Workdir)?;
        let state: serde_json::Value = serde_json::from_str(&state_text)
            .map_err(|e| SandboxError::StateCorrupted(format!("state file unparseable: {e}")))?;
        match state {
            serde_json::Value::Object(map) => {
                namespace.replace(map.into_iter().collect());
            }
            other => {
                return Err(SandboxError::StateCorrupted(format!(
                    "state file holds {other} instead of an object"
                )));
            }
        }

        debug!(block = %block.name, bindings = namespace.len(), "Namespace captured");
        Ok(ExecutionResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            duration_ms,
            exit_code: output.status.code(),
        })
    }
}

static FROM_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*from\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());
static PLAIN_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*import\s+(.+)$").unwrap());
static MODULE_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// Extracts top-level imported module names from Python source.
///
/// Purely line-based: `import a, b.c` and `from x.y import z` contribute
/// `a`, `b`, and `x`. Relative imports and `__future__` are skipped.
fn extract_imports(source: &str) -> Vec<String> {
    let mut modules: Vec<String> = Vec::new();
    let mut push = |root: &str| {
        if root == "__future__" {
            return;
        }
        if !modules.iter().any(|m| m == root) {
            modules.push(root.to_string());
        }
    };

    for line in source.lines() {
        if let Some(caps) = FROM_IMPORT.captures(line) {
            push(&caps[1]);
        } else if let Some(caps) = PLAIN_IMPORT.captures(line) {
            let rest = caps[1].split('#').next().unwrap_or_default();
            for part in rest.split(',') {
                if let Some(root) = MODULE_ROOT.captures(part) {
                    push(&root[1]);
                }
            }
        }
    }
    modules
}

/// Maps an import name to the pip package providing it, for the handful of
/// packages whose names differ.
fn module_to_package(module: &str) -> &str {
    match module {
        "cv2" => "opencv-python",
        "sklearn" => "scikit-learn",
        "PIL" => "pillow",
        "yaml" => "pyyaml",
        "bs4" => "beautifulsoup4",
        other => other,
    }
}

/// Reduces a block name to something safe as a file stem.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() { "block".to_string() } else { stem }
}
