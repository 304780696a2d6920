//! Wire protocol for client-server communication.
//!
//! Clients send `{"type": ..., "data": {...}}`; the server answers with
//! `ProtocolEnvelope`s.

use forge_core::{FileMap, MessageType, ProjectSnapshot, ProtocolEnvelope};
use forge_session::InitOutcome;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Bind the session to a sandbox.
    Init,
    /// Feedback for a new edit turn.
    User { text: String },
    /// Read the sandbox's current code.
    LoadCode,
    /// Commit files directly.
    EditCode { code_map: FileMap },
}

/// Why a client frame was not accepted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("No text provided")]
    MissingText,
    #[error("Invalid code map: {0}")]
    InvalidCodeMap(String),
}

impl ProtocolError {
    /// Whether the client should be told about this error.
    ///
    /// Malformed frames and unknown types are only logged.
    #[must_use]
    pub const fn is_reportable(&self) -> bool {
        matches!(self, Self::MissingText | Self::InvalidCodeMap(_))
    }

    /// Channel an error reply is sent on.
    #[must_use]
    pub const fn reply_type(&self) -> MessageType {
        match self {
            Self::InvalidCodeMap(_) => MessageType::EditCode,
            _ => MessageType::AgentFinal,
        }
    }
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl ClientMessage {
    /// Parse a client text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not JSON, has an unknown type, or lacks
    /// the fields its type requires.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(frame)?;
        match raw.kind.as_str() {
            "init" => Ok(Self::Init),
            "load_code" => Ok(Self::LoadCode),
            "user" => raw
                .data
                .get("text")
                .and_then(Value::as_str)
                .filter(|text| !text.trim().is_empty())
                .map(|text| Self::User {
                    text: text.to_string(),
                })
                .ok_or(ProtocolError::MissingText),
            "edit_code" => {
                let code_map = raw
                    .data
                    .get("code_map")
                    .cloned()
                    .ok_or_else(|| ProtocolError::InvalidCodeMap("missing code_map".into()))?;
                serde_json::from_value(code_map)
                    .map(|code_map| Self::EditCode { code_map })
                    .map_err(|e| ProtocolError::InvalidCodeMap(e.to_string()))
            }
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// Reply to `init`: the binding plus whether it existed before.
#[must_use]
pub fn init_reply(session_id: &str, outcome: &InitOutcome) -> ProtocolEnvelope {
    let mut data = serde_json::to_value(&outcome.binding).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut data {
        map.insert("exists".into(), outcome.preexisting.into());
    }
    ProtocolEnvelope::new(MessageType::Init, data, session_id)
}

/// Reply to `load_code`.
#[must_use]
pub fn load_code_reply(session_id: &str, snapshot: &ProjectSnapshot) -> ProtocolEnvelope {
    ProtocolEnvelope::new(
        MessageType::LoadCode,
        json!({ "code_map": snapshot.files, "package_json": snapshot.manifest }),
        session_id,
    )
}

/// Reply to a successful `edit_code`.
#[must_use]
pub fn edit_code_reply(session_id: &str, files: &FileMap) -> ProtocolEnvelope {
    ProtocolEnvelope::new(
        MessageType::EditCode,
        json!({ "status": "ok", "files": files.keys().collect::<Vec<_>>() }),
        session_id,
    )
}

/// Error reply on the channel of the request that failed.
#[must_use]
pub fn error_reply(
    session_id: &str,
    kind: MessageType,
    message: impl std::fmt::Display,
) -> ProtocolEnvelope {
    ProtocolEnvelope::new(kind, json!({ "error": message.to_string() }), session_id)
}

#[cfg(test)]
mod tests {
    use forge_core::{BindingStatus, SandboxBinding};

    use super::*;

    #[test]
    fn test_parse_known_types() {
        assert_eq!(ClientMessage::parse(r#"{"type":"init"}"#).unwrap(), ClientMessage::Init);
        assert_eq!(
            ClientMessage::parse(r#"{"type":"load_code","data":{}}"#).unwrap(),
            ClientMessage::LoadCode
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"user","data":{"text":"add a header"}}"#).unwrap(),
            ClientMessage::User {
                text: "add a header".into()
            }
        );

        let parsed = ClientMessage::parse(
            r#"{"type":"edit_code","data":{"code_map":{"App.tsx":"<header/>"}}}"#,
        )
        .unwrap();
        let ClientMessage::EditCode { code_map } = parsed else {
            panic!("expected edit_code");
        };
        assert_eq!(code_map["App.tsx"], "<header/>");
    }

    #[test]
    fn test_parse_rejections() {
        let malformed = ClientMessage::parse("{not json").unwrap_err();
        assert!(matches!(malformed, ProtocolError::Malformed(_)));
        assert!(!malformed.is_reportable());

        let unknown = ClientMessage::parse(r#"{"type":"ping"}"#).unwrap_err();
        assert!(matches!(&unknown, ProtocolError::UnknownType(t) if t == "ping"));
        assert!(!unknown.is_reportable());

        for frame in [
            r#"{"type":"user"}"#,
            r#"{"type":"user","data":{"text":"  "}}"#,
            r#"{"type":"user","data":{"text":42}}"#,
        ] {
            let err = ClientMessage::parse(frame).unwrap_err();
            assert!(matches!(err, ProtocolError::MissingText));
            assert_eq!(err.reply_type(), MessageType::AgentFinal);
        }

        let bad_map =
            ClientMessage::parse(r#"{"type":"edit_code","data":{"code_map":["a"]}}"#).unwrap_err();
        assert!(bad_map.is_reportable());
        assert_eq!(bad_map.reply_type(), MessageType::EditCode);
    }

    #[test]
    fn test_init_reply_shape() {
        let outcome = InitOutcome {
            binding: SandboxBinding {
                sandbox_id: "sb-1".into(),
                url: "http://localhost:3100".into(),
                port: 3100,
                status: BindingStatus::Active,
            },
            preexisting: false,
        };
        let reply = init_reply("s1", &outcome);
        assert_eq!(reply.kind, MessageType::Init);
        assert_eq!(reply.data["sandbox_id"], "sb-1");
        assert_eq!(reply.data["port"], 3100);
        assert_eq!(reply.data["exists"], false);
        assert_eq!(reply.session_id, "s1");
    }

    #[test]
    fn test_load_code_reply_shape() {
        let mut files = FileMap::new();
        files.insert("/app/src/App.tsx".into(), "<empty/>".into());
        let snapshot = ProjectSnapshot {
            files,
            manifest: "{}".into(),
        };
        let reply = load_code_reply("s1", &snapshot);
        assert_eq!(reply.data["code_map"]["/app/src/App.tsx"], "<empty/>");
        assert_eq!(reply.data["package_json"], "{}");
    }
}
