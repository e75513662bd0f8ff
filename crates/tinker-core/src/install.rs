//! The dependency installer boundary.
//!
//! Invoked only after an install request was approved through the pipeline.
//! The pip implementation lives in the adapters crate.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("installer unavailable: {0}")]
    Unavailable(String),
    #[error("failed to install {packages:?}: {message}")]
    Failed {
        packages: Vec<String>,
        message: String,
    },
}

/// Installs packages into the sandbox's runtime environment.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, packages: &[String]) -> Result<(), InstallError>;
}

/// Installer used when none is configured: every install fails, which the
/// round loop reports back to the LLM as a declined dependency.
pub struct NoInstaller;

#[async_trait]
impl DependencyInstaller for NoInstaller {
    async fn install(&self, _packages: &[String]) -> Result<(), InstallError> {
        Err(InstallError::Unavailable(
            "no dependency installer configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_installer_always_fails() {
        let err = NoInstaller.install(&["pandas".into()]).await.unwrap_err();
        assert!(matches!(err, InstallError::Unavailable(_)));
    }
}
