//! Shared domain types for commsync.
//!
//! Both the server (room bus, message store) and the client runtime
//! (reconciliation cache, live session) speak in terms of these types, so
//! they live in their own crate with no async or I/O dependencies.

pub mod message;
pub mod protocol;
pub mod room;

pub use message::{
    ASSISTANT_TOKEN, AssistantReply, FileMeta, MAX_BODY_CHARS, Message, MessageKind,
    MessagePayload, Sender, normalize_timestamp,
};
pub use protocol::{ClientEvent, OutgoingMessage, Rejection, ServerEvent};
pub use room::{ASSISTANT_ID, IdError, ParticipantId, RoomId};
