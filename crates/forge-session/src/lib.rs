//! Session orchestration for the live-preview edit service.
//!
//! Provides:
//! - `SessionRegistry` - Session to sandbox bindings and history
//! - `EditCoordinator` - Streaming feedback turns and direct edits
//! - Session stores (memory, SQLite) and `LocalProjectStore`

pub mod coordinator;
pub mod projects;
pub mod registry;
pub mod storage;

pub use coordinator::{CoordinatorError, EditCoordinator, TurnStream};
pub use projects::LocalProjectStore;
pub use registry::{InitOutcome, RegistryError, SessionRegistry, SessionStatus};
