use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::room::ParticipantId;

/// Longest accepted message body, in characters.
pub const MAX_BODY_CHARS: usize = 1000;

/// Substring that addresses the assistant inside a `user-text` body.
pub const ASSISTANT_TOKEN: &str = "@ai";

/// Truncate a timestamp to the millisecond precision stored and sent on the wire.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    #[default]
    UserText,
    AssistantText,
    FileShare,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserText => "user-text",
            Self::AssistantText => "assistant-text",
            Self::FileShare => "file-share",
        }
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user-text" => Ok(Self::UserText),
            "assistant-text" => Ok(Self::AssistantText),
            "file-share" => Ok(Self::FileShare),
            _ => Err(format!("Invalid message kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sender {
    pub participant_id: ParticipantId,
    pub display_label: String,
}

impl Sender {
    pub fn new(participant_id: ParticipantId, display_label: impl Into<String>) -> Self {
        Self {
            participant_id,
            display_label: display_label.into(),
        }
    }

    pub fn assistant() -> Self {
        Self::new(ParticipantId::assistant(), "AI")
    }
}

/// Metadata for a file that was uploaded to object storage and shared in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub storage_key: String,
    pub external_url: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

/// Structured body of an `assistant-text` message.
///
/// The generator is asked for JSON; `file_tree` is an opaque snapshot that
/// clients mount into their sandbox runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantReply {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<serde_json::Value>,
}

impl AssistantReply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            file_tree: None,
            build_command: None,
            start_command: None,
        }
    }

    /// Interpret raw generator output.
    ///
    /// Accepts a bare JSON object, JSON wrapped in a markdown fence, or plain
    /// prose (which becomes `{ "text": <prose> }`).
    pub fn from_generated(raw: &str) -> Self {
        let trimmed = raw.trim();
        let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => trimmed,
        };
        serde_json::from_str::<AssistantReply>(candidate).unwrap_or_else(|_| Self::plain(trimmed))
    }
}

/// A message body resolved according to its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload<'a> {
    Text(&'a str),
    Assistant(AssistantReply),
    File {
        caption: &'a str,
        file: Option<&'a FileMeta>,
    },
}

/// The atomic unit of a room's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Assigned by the store; absent until persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub body: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileMeta>,
}

impl Message {
    pub fn user_text(sender: Sender, body: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: None,
            body: body.into(),
            sender,
            timestamp: normalize_timestamp(timestamp),
            kind: MessageKind::UserText,
            file: None,
        }
    }

    pub fn file_share(
        sender: Sender,
        caption: impl Into<String>,
        file: FileMeta,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            body: caption.into(),
            sender,
            timestamp: normalize_timestamp(timestamp),
            kind: MessageKind::FileShare,
            file: Some(file),
        }
    }

    /// An assistant-authored message; the body is the serialized reply.
    pub fn assistant(reply: &AssistantReply, timestamp: DateTime<Utc>) -> Self {
        // AssistantReply holds only strings and JSON values, so serialization cannot fail.
        let body = serde_json::to_string(reply).unwrap_or_else(|_| reply.text.clone());
        Self {
            id: None,
            body,
            sender: Sender::assistant(),
            timestamp: normalize_timestamp(timestamp),
            kind: MessageKind::AssistantText,
            file: None,
        }
    }

    pub fn payload(&self) -> MessagePayload<'_> {
        match self.kind {
            MessageKind::UserText => MessagePayload::Text(&self.body),
            MessageKind::AssistantText => {
                MessagePayload::Assistant(AssistantReply::from_generated(&self.body))
            }
            MessageKind::FileShare => MessagePayload::File {
                caption: &self.body,
                file: self.file.as_ref(),
            },
        }
    }

    /// Whether this message should trigger the assistant.
    pub fn addresses_assistant(&self) -> bool {
        self.kind == MessageKind::UserText && self.body.contains(ASSISTANT_TOKEN)
    }

    /// The body with the first addressing token removed.
    pub fn assistant_prompt(&self) -> String {
        self.body.replacen(ASSISTANT_TOKEN, "", 1).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alice() -> Sender {
        Sender::new(ParticipantId::user("u-alice").unwrap(), "alice@example.com")
    }

    #[test]
    fn test_message_wire_shape() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let msg = Message::user_text(alice(), "hello", ts);
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["body"], "hello");
        assert_eq!(json["kind"], "user-text");
        assert_eq!(json["sender"]["participantId"], "u-alice");
        assert_eq!(json["sender"]["displayLabel"], "alice@example.com");
        assert!(json.get("id").is_none());
        assert!(json.get("file").is_none());
    }

    #[test]
    fn test_kind_defaults_to_user_text() {
        let json = r#"{"body":"x","sender":{"participantId":"u1","displayLabel":"a"},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::UserText);
        assert_eq!(msg.id, None);
    }

    #[test]
    fn test_timestamps_are_truncated_to_millis() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let msg = Message::user_text(alice(), "x", ts);
        assert_eq!(msg.timestamp.timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn test_addresses_assistant_only_for_user_text() {
        let now = Utc::now();
        assert!(Message::user_text(alice(), "hello @ai", now).addresses_assistant());
        assert!(!Message::user_text(alice(), "hello ai", now).addresses_assistant());

        let file = FileMeta {
            name: "notes@ai.txt".into(),
            storage_key: "k".into(),
            external_url: "https://files.example/k".into(),
            size_bytes: 3,
            mime_type: "text/plain".into(),
        };
        let shared = Message::file_share(alice(), "Shared file: notes @ai", file, now);
        assert!(!shared.addresses_assistant());

        let reply = Message::assistant(&AssistantReply::plain("@ai says hi"), now);
        assert!(!reply.addresses_assistant());
    }

    #[test]
    fn test_assistant_prompt_strips_first_token() {
        let msg = Message::user_text(alice(), "@ai build a server @ai", Utc::now());
        assert_eq!(msg.assistant_prompt(), "build a server @ai");
    }

    #[test]
    fn test_assistant_reply_from_json() {
        let raw = r#"{"text":"done","fileTree":{"app.js":{"file":{"contents":"x"}}}}"#;
        let reply = AssistantReply::from_generated(raw);
        assert_eq!(reply.text, "done");
        assert!(reply.file_tree.is_some());
    }

    #[test]
    fn test_assistant_reply_from_fenced_json() {
        let raw = "```json\n{\"text\":\"fenced\"}\n```";
        assert_eq!(AssistantReply::from_generated(raw).text, "fenced");
    }

    #[test]
    fn test_assistant_reply_from_prose() {
        let reply = AssistantReply::from_generated("  42  ");
        assert_eq!(reply, AssistantReply::plain("42"));
    }

    #[test]
    fn test_assistant_message_payload_resolves_reply() {
        let reply = AssistantReply {
            text: "here".into(),
            file_tree: Some(serde_json::json!({"index.js": {}})),
            build_command: None,
            start_command: None,
        };
        let msg = Message::assistant(&reply, Utc::now());
        assert_eq!(msg.sender, Sender::assistant());
        assert_eq!(msg.kind, MessageKind::AssistantText);
        match msg.payload() {
            MessagePayload::Assistant(parsed) => assert_eq!(parsed, reply),
            other => panic!("Expected assistant payload, got {:?}", other),
        }
    }

    #[test]
    fn test_message_kind_from_str() {
        assert_eq!("file-share".parse::<MessageKind>(), Ok(MessageKind::FileShare));
        assert!("user".parse::<MessageKind>().is_err());
    }
}
