//! Core abstractions for the live-preview edit service.
//!
//! This crate provides the shared building blocks:
//! - `ProtocolEnvelope` / `MessageType` - Server-to-client wire messages
//! - Session, binding and edit-stream data model
//! - Collaborator traits: `SessionStore`, `EditModel`, `ProjectStore`

pub mod envelope;
pub mod model;
pub mod traits;

pub use envelope::{MessageType, ProtocolEnvelope};
pub use model::{
    BindingStatus, ConversationTurn, EditPartial, EditRequest, FileEntry, FileMap, PlanPartial,
    PlanState, ProjectSnapshot, Role, SandboxBinding,
};
pub use traits::{
    EditModel, ExportFormat, PartialStream, PersistenceError, ProjectStore, ProjectStoreError,
    ProjectSummary, RecordStatus, RecordUpdate, SessionId, SessionRecord, SessionStore,
    StoredMessage, StoredProject, StreamError,
};
