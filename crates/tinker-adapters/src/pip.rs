//! Pip-based dependency installer.
//!
//! Runs `python -m pip install` for packages the sandbox reported missing.
//! Successfully installed packages are cached so repeated requests within
//! one process are free.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use tinker_core::{DependencyInstaller, InstallError};
use tokio::process::Command;
use tracing::{debug, info};

pub struct PipInstaller {
    python_bin: String,
    quiet: bool,
    installed: Mutex<HashSet<String>>,
}

impl PipInstaller {
    pub fn new(python_bin: impl Into<String>) -> Self {
        Self {
            python_bin: python_bin.into(),
            quiet: true,
            installed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn uncached(&self, packages: &[String]) -> Vec<String> {
        let installed = self.installed.lock().expect("install cache poisoned");
        packages
            .iter()
            .filter(|p| !installed.contains(*p))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl DependencyInstaller for PipInstaller {
    async fn install(&self, packages: &[String]) -> Result<(), InstallError> {
        let pending = self.uncached(packages);
        if pending.is_empty() {
            debug!("All requested packages already installed");
            return Ok(());
        }

        let mut cmd = Command::new(&self.python_bin);
        cmd.arg("-m").arg("pip").arg("install");
        if self.quiet {
            cmd.arg("-q");
        }
        cmd.args(&pending);

        info!(packages = ?pending, "Installing packages via pip");
        let output = cmd
            .output()
            .await
            .map_err(|e| InstallError::Unavailable(format!("{}: {e}", self.python_bin)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            tail.reverse();
            return Err(InstallError::Failed {
                packages: pending,
                message: tail.join("\n"),
            });
        }

        let mut installed = self.installed.lock().expect("install cache poisoned");
        installed.extend(pending);
        Ok(())
    }
}
