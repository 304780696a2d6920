//! Backend capability trait and factory.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::{BackendKind, SandboxConfig},
    error::BackendError,
};

/// Everything a backend needs to provision one sandbox.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    /// Resource name, unique per creation.
    pub name: String,
    pub session_id: String,
    /// Host port the preview server is reachable on.
    pub host_port: u16,
    pub image: String,
    pub working_dir: String,
    /// Port the preview server listens on inside the sandbox.
    pub container_port: u16,
    /// Long-running preview command; `{port}` is substituted by the backend.
    pub preview_command: Option<String>,
}

/// Result of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Capabilities every sandbox backend provides.
///
/// Paths are absolute sandbox paths such as `/app/src/App.tsx`.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Backend kind, for logging.
    fn kind(&self) -> BackendKind;

    /// Provision and start a sandbox. Returns the backend resource id.
    async fn provision(&self, spec: &ProvisionSpec) -> Result<String, BackendError>;

    /// Force-remove a sandbox by id or name.
    ///
    /// Returns `Ok(false)` when nothing by that id or name existed.
    async fn remove(&self, name_or_id: &str) -> Result<bool, BackendError>;

    /// Whether the sandbox still exists.
    async fn exists(&self, sandbox_id: &str) -> Result<bool, BackendError>;

    /// Write a file, creating missing parent directories.
    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), BackendError>;

    /// Read a file.
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, BackendError>;

    /// Every regular file below `root`, recursively.
    async fn list_files(&self, sandbox_id: &str, root: &str) -> Result<Vec<String>, BackendError>;

    /// Run a shell command in the sandbox working directory.
    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput, BackendError>;

    /// Mark the sandbox as recently used.
    async fn keep_alive(&self, _sandbox_id: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Build the backend selected by configuration.
///
/// # Errors
///
/// Returns an error if the backend was not compiled in or cannot connect.
pub fn build_backend(config: &SandboxConfig) -> Result<Arc<dyn SandboxBackend>, BackendError> {
    match config.backend {
        #[cfg(feature = "memory")]
        BackendKind::Memory => Ok(Arc::new(crate::memory::MemoryBackend::new())),
        #[cfg(feature = "local")]
        BackendKind::Local => Ok(Arc::new(crate::local::LocalBackend::new(
            config.local_root.clone(),
            config.template_dir.clone(),
        ))),
        #[cfg(feature = "docker")]
        BackendKind::Docker => Ok(Arc::new(crate::docker::DockerBackend::connect()?)),
        #[allow(unreachable_patterns)]
        other => Err(BackendError::Unsupported(format!(
            "{other} backend not compiled in"
        ))),
    }
}

/// Split an absolute sandbox path into normalized components.
///
/// Rejects relative paths and any `..` component.
pub(crate) fn path_components(path: &str) -> Result<Vec<&str>, BackendError> {
    if !path.starts_with('/') {
        return Err(BackendError::InvalidPath(path.to_string()));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(BackendError::InvalidPath(path.to_string())),
            other => parts.push(other),
        }
    }
    Ok(parts)
}
