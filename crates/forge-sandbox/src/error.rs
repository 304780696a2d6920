//! Sandbox error types.

use thiserror::Error;

/// Error raised by a sandbox backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Sandbox resource not found: {0}")]
    NotFound(String),
    #[error("Invalid sandbox path: {0}")]
    InvalidPath(String),
    #[error("Backend not available: {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "docker")]
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("Backend error: {0}")]
    Other(String),
}

/// Port allocation error.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("No free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },
}

/// Error raised by the sandbox orchestrator.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox not found: {0}")]
    NotFound(String),
    #[error("Sandbox creation failed for session {session_id}: {reason}")]
    CreationFailed { session_id: String, reason: String },
    #[error("Upload to sandbox {sandbox_id} failed at {path} ({} file(s) already written): {reason}", written.len())]
    UploadFailed {
        sandbox_id: String,
        path: String,
        written: Vec<String>,
        reason: String,
    },
    #[error("Download from sandbox {sandbox_id} failed: {reason}")]
    DownloadFailed { sandbox_id: String, reason: String },
    #[error("Command failed in sandbox {sandbox_id}: {reason}")]
    ExecFailed { sandbox_id: String, reason: String },
    #[error(transparent)]
    Backend(#[from] BackendError),
}
