//! Collaborator traits: persistence, LLM streaming and project storage.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{EditPartial, EditRequest, FileMap, Role};

/// Client-supplied session identifier.
pub type SessionId = String;

/// Persisted session status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Created,
    Active,
    Error,
}

impl RecordStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Error => "error",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "active" => Ok(Self::Active),
            "error" => Ok(Self::Error),
            other => Err(PersistenceError::Failed(format!("unknown status: {other}"))),
        }
    }
}

/// Persisted session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub sandbox_id: Option<String>,
    pub sandbox_url: Option<String>,
    pub status: RecordStatus,
    pub metadata: Value,
    /// Unix epoch seconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields to change on a session record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub sandbox_id: Option<String>,
    pub sandbox_url: Option<String>,
    pub status: Option<RecordStatus>,
    pub metadata: Option<Value>,
}

/// Persisted conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub session_id: SessionId,
    pub role: Role,
    pub content: String,
    pub message_type: String,
    pub created_at: i64,
}

/// Persistence error.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Session record not found: {0}")]
    NotFound(SessionId),
    #[error("Session record already exists: {0}")]
    AlreadyExists(SessionId),
    #[error("Persistence failed: {0}")]
    Failed(String),
}

/// External store for session records, conversation and file versions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a record for a new session.
    async fn create_record(
        &self,
        session_id: &str,
        metadata: Value,
    ) -> Result<SessionRecord, PersistenceError>;

    /// Get a session record.
    async fn get_record(&self, session_id: &str) -> Result<Option<SessionRecord>, PersistenceError>;

    /// Update selected fields of a record.
    async fn update_record(
        &self,
        session_id: &str,
        update: RecordUpdate,
    ) -> Result<SessionRecord, PersistenceError>;

    /// Append a conversation message.
    async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        message_type: &str,
    ) -> Result<(), PersistenceError>;

    /// Most recent `limit` messages, oldest first.
    async fn messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PersistenceError>;

    /// Save a new version of a file and return its version number.
    async fn save_file_version(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<u32, PersistenceError>;

    /// Delete every record of a session. Returns whether anything existed.
    async fn delete_session(&self, session_id: &str) -> Result<bool, PersistenceError>;
}

/// LLM stream error.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Edit stream unavailable: {0}")]
    Unavailable(String),
    #[error("Edit stream interrupted: {0}")]
    Interrupted(String),
    #[error("Edit stream ended before the plan completed")]
    Incomplete,
}

/// Stream of cumulative partials for one turn.
pub type PartialStream = BoxStream<'static, Result<EditPartial, StreamError>>;

/// LLM streaming collaborator.
///
/// Each call yields a finite, non-restartable stream of cumulative snapshots.
#[async_trait]
pub trait EditModel: Send + Sync {
    /// Open the edit stream for one turn.
    async fn stream_edit(&self, request: EditRequest) -> Result<PartialStream, StreamError>;
}

/// Archive format for project export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Tar,
    #[default]
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl ExportFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
        }
    }

    #[must_use]
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Tar => "application/x-tar",
            Self::TarGz => "application/gzip",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = ProjectStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tar" => Ok(Self::Tar),
            "tar.gz" | "tgz" => Ok(Self::TarGz),
            other => Err(ProjectStoreError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Project files plus metadata as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProject {
    pub files: FileMap,
    pub metadata: Value,
}

/// Listing entry of the project store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub project_id: String,
    pub session_id: Option<String>,
    pub created_at: Option<String>,
    pub file_count: usize,
    pub size: u64,
}

/// Project store error.
#[derive(Debug, Error)]
pub enum ProjectStoreError {
    #[error("Project not found: {0}")]
    NotFound(String),
    #[error("Export format not supported: {0}")]
    UnsupportedFormat(String),
    #[error("Invalid project path: {0}")]
    InvalidPath(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Whole-project save, load and export, outside the turn path.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Save files and return the new project id.
    async fn save(
        &self,
        session_id: &str,
        files: &FileMap,
        metadata: Value,
    ) -> Result<String, ProjectStoreError>;

    /// Load a project's files and metadata.
    async fn load(&self, project_id: &str) -> Result<StoredProject, ProjectStoreError>;

    /// List projects, newest first.
    async fn list(&self, limit: usize) -> Result<Vec<ProjectSummary>, ProjectStoreError>;

    /// Delete a project. Returns whether it existed.
    async fn delete(&self, project_id: &str) -> Result<bool, ProjectStoreError>;

    /// Export a project as an archive.
    async fn export(
        &self,
        project_id: &str,
        format: ExportFormat,
    ) -> Result<Vec<u8>, ProjectStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_format_parsing() {
        assert_eq!("tar".parse::<ExportFormat>().unwrap(), ExportFormat::Tar);
        assert_eq!("TGZ".parse::<ExportFormat>().unwrap(), ExportFormat::TarGz);
        assert!(matches!(
            "zip".parse::<ExportFormat>(),
            Err(ProjectStoreError::UnsupportedFormat(f)) if f == "zip"
        ));
    }

    #[test]
    fn test_record_status_roundtrip_through_str() {
        for status in [RecordStatus::Created, RecordStatus::Active, RecordStatus::Error] {
            assert_eq!(status.as_str().parse::<RecordStatus>().unwrap(), status);
        }
        assert!("gone".parse::<RecordStatus>().is_err());
    }
}
