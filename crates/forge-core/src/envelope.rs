//! Server-to-client envelope and the closed set of message types.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Closed set of message types carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Session initialization.
    Init,
    /// User feedback.
    User,
    /// Progressive plan text.
    AgentPartial,
    /// Final plan text, or a terminal turn error.
    AgentFinal,
    /// Current code of the session's sandbox.
    LoadCode,
    /// Direct file edit.
    EditCode,
    /// A feedback turn has started.
    UpdateInProgress,
    /// A file is being edited in the current turn.
    UpdateFile,
    /// The current turn committed its files.
    UpdateCompleted,
}

impl MessageType {
    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::User => "user",
            Self::AgentPartial => "agent_partial",
            Self::AgentFinal => "agent_final",
            Self::LoadCode => "load_code",
            Self::EditCode => "edit_code",
            Self::UpdateInProgress => "update_in_progress",
            Self::UpdateFile => "update_file",
            Self::UpdateCompleted => "update_completed",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Epoch milliseconds, strictly increasing across calls in this process.
#[must_use]
pub fn next_timestamp() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let candidate = if now > last { now } else { last + 1 };
        match LAST_TIMESTAMP.compare_exchange_weak(
            last,
            candidate,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return candidate,
            Err(actual) => last = actual,
        }
    }
}

/// Fresh correlation id.
#[must_use]
pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Uniform message delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEnvelope {
    /// Correlation key.
    pub id: String,
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Free-form payload.
    pub data: Value,
    /// Emission time (epoch millis).
    pub timestamp: i64,
    /// Owning session.
    pub session_id: String,
}

impl ProtocolEnvelope {
    /// Build an envelope with a fresh correlation id.
    #[must_use]
    pub fn new(kind: MessageType, data: Value, session_id: impl Into<String>) -> Self {
        Self::with_id(correlation_id(), kind, data, session_id)
    }

    /// Build an envelope that continues an existing correlation group.
    #[must_use]
    pub fn with_id(
        id: impl Into<String>,
        kind: MessageType,
        data: Value,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            data,
            timestamp: next_timestamp(),
            session_id: session_id.into(),
        }
    }

    /// Terminal error on the `agent_final` channel.
    #[must_use]
    pub fn error(
        id: impl Into<String>,
        message: impl std::fmt::Display,
        session_id: impl Into<String>,
    ) -> Self {
        Self::with_id(
            id,
            MessageType::AgentFinal,
            json!({ "error": message.to_string() }),
            session_id,
        )
    }

    /// Error text if this envelope carries one.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    /// `text` field of the payload, if any.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.data.get("text").and_then(Value::as_str)
    }
}
