//! Session, binding and edit-stream data model.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Path to content map of a project's text files.
pub type FileMap = BTreeMap<String, String>;

/// Lifecycle status of a sandbox binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingStatus {
    /// No sandbox bound yet.
    #[default]
    Absent,
    /// A sandbox is being provisioned or reconnected.
    Creating,
    /// The sandbox is usable.
    Active,
    /// Provisioning failed.
    Error,
}

/// Association between a session and its sandbox.
///
/// Replaced as a whole; never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxBinding {
    /// Backend resource identifier.
    pub sandbox_id: String,
    /// Preview URL.
    pub url: String,
    /// Host port of the preview server.
    pub port: u16,
    /// Binding status.
    pub status: BindingStatus,
}

impl SandboxBinding {
    /// Whether the binding can serve turns.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == BindingStatus::Active
    }
}

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One finalized conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Current code of a sandbox plus its package manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub files: FileMap,
    pub manifest: String,
}

/// Progress state of the plan inside a partial.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanState {
    Incomplete,
    Complete,
    #[default]
    #[serde(other)]
    Pending,
}

/// Plan portion of a partial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanPartial {
    #[serde(deserialize_with = "null_as_default")]
    pub state: PlanState,
    #[serde(deserialize_with = "null_as_default")]
    pub value: String,
}

/// One file of a partial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
}

impl FileEntry {
    #[must_use]
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Cumulative snapshot produced by the LLM collaborator.
///
/// Each partial refines the previous one; it is not a delta. Missing or
/// `null` fields deserialize to their empty defaults, and an unknown plan
/// state reads as `Pending`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditPartial {
    #[serde(deserialize_with = "null_as_default")]
    pub plan: PlanPartial,
    #[serde(deserialize_with = "null_as_default")]
    pub files: Vec<FileEntry>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl EditPartial {
    /// Partial whose plan is still in progress.
    #[must_use]
    pub fn planning(text: impl Into<String>) -> Self {
        Self {
            plan: PlanPartial {
                state: PlanState::Incomplete,
                value: text.into(),
            },
            files: Vec::new(),
        }
    }

    /// Partial whose plan is complete.
    #[must_use]
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            plan: PlanPartial {
                state: PlanState::Complete,
                value: text.into(),
            },
            files: Vec::new(),
        }
    }

    /// Add a file entry.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push(FileEntry::new(path, content));
        self
    }

    #[must_use]
    pub fn is_plan_complete(&self) -> bool {
        self.plan.state == PlanState::Complete
    }
}

/// Context handed to the LLM collaborator for one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRequest {
    pub history: Vec<ConversationTurn>,
    pub feedback: String,
    pub files: Vec<FileEntry>,
    pub manifest: String,
}

impl EditRequest {
    #[must_use]
    pub fn new(history: Vec<ConversationTurn>, feedback: String, snapshot: ProjectSnapshot) -> Self {
        let files = snapshot
            .files
            .into_iter()
            .map(|(path, content)| FileEntry { path, content })
            .collect();
        Self {
            history,
            feedback,
            files,
            manifest: snapshot.manifest,
        }
    }
}
