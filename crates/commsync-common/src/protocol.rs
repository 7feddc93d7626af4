//! Frames exchanged over a room connection.
//!
//! Every frame is a JSON object `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{FileMeta, Message, MessageKind};

/// What a client publishes. Sender, timestamp and id are assigned server-side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            kind: MessageKind::UserText,
            file: None,
        }
    }

    pub fn file(caption: impl Into<String>, file: FileMeta) -> Self {
        Self {
            body: caption.into(),
            kind: MessageKind::FileShare,
            file: Some(file),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    RoomMessage(OutgoingMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    RoomMessage(Message),
    /// Sent only to the originator of a frame that was refused.
    Error { code: String, message: String },
}

/// Why a connection attempt was refused before joining a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rejection {
    #[error("invalid-room")]
    InvalidRoom,
    #[error("missing-credential")]
    MissingCredential,
    #[error("invalid-credential")]
    InvalidCredential,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRoom => "invalid-room",
            Self::MissingCredential => "missing-credential",
            Self::InvalidCredential => "invalid-credential",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "invalid-room" => Some(Self::InvalidRoom),
            "missing-credential" => Some(Self::MissingCredential),
            "invalid-credential" => Some(Self::InvalidCredential),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_frame_shape() {
        let frame = ClientEvent::RoomMessage(OutgoingMessage::text("hi @ai"));
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "room-message");
        assert_eq!(json["data"]["body"], "hi @ai");
        assert_eq!(json["data"]["kind"], "user-text");
    }

    #[test]
    fn test_client_event_kind_optional() {
        let frame: ClientEvent =
            serde_json::from_str(r#"{"event":"room-message","data":{"body":"plain"}}"#).unwrap();
        let ClientEvent::RoomMessage(msg) = frame;
        assert_eq!(msg.kind, MessageKind::UserText);
        assert!(msg.file.is_none());
    }

    #[test]
    fn test_server_error_frame_shape() {
        let frame = ServerEvent::Error {
            code: "validation".into(),
            message: "message body is empty".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["code"], "validation");
    }

    #[test]
    fn test_rejection_codes_are_stable() {
        for rejection in [
            Rejection::InvalidRoom,
            Rejection::MissingCredential,
            Rejection::InvalidCredential,
        ] {
            assert_eq!(Rejection::from_code(rejection.code()), Some(rejection));
            assert_eq!(rejection.to_string(), rejection.code());
            assert_eq!(
                serde_json::to_value(rejection).unwrap(),
                serde_json::Value::String(rejection.code().to_string())
            );
        }
        assert_eq!(Rejection::from_code("nope"), None);
    }
}
