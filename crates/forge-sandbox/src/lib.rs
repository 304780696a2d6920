//! Sandbox lifecycle management.
//!
//! Provides:
//! - `SandboxOrchestrator` - Create, reconnect, transfer files and clean up
//! - `SandboxBackend` - Capability trait with memory, local and Docker backends
//! - `PortPool` - Host port allocation for preview servers

pub mod backend;
pub mod config;
#[cfg(feature = "docker")]
pub mod docker;
pub mod error;
#[cfg(feature = "local")]
pub mod local;
#[cfg(feature = "memory")]
pub mod memory;
pub mod orchestrator;
pub mod ports;
pub mod workspace;

pub use backend::{ExecOutput, ProvisionSpec, SandboxBackend, build_backend};
pub use config::{BackendKind, SandboxConfig};
pub use error::{BackendError, PortError, SandboxError};
#[cfg(feature = "memory")]
pub use memory::MemoryBackend;
pub use orchestrator::{SandboxOrchestrator, SandboxRecord, sandbox_name};
pub use ports::PortPool;
