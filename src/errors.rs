//! Typed error hierarchy for commsync.
//!
//! Four top-level enums cover the subsystems:
//! - `StoreError`: message store and membership checks
//! - `ValidationError`: malformed client payloads
//! - `AssistantError`: text-generation collaborator failures
//! - `SessionError`: client-side live session failures

use commsync_common::{MAX_BODY_CHARS, Rejection, RoomId};
use thiserror::Error;

/// Errors from the message store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Access denied to room {room}")]
    AccessDenied { room: RoomId },

    #[error("Room {room} not found")]
    RoomNotFound { room: RoomId },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),
}

/// A client payload that was refused before anything was persisted or sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message body is empty")]
    EmptyBody,

    #[error("message body is {len} characters (max {max})", max = MAX_BODY_CHARS)]
    BodyTooLong { len: usize },

    #[error("file-share message has no file attached")]
    MissingFile,

    #[error("'{kind}' messages cannot be published by participants")]
    ReservedKind { kind: &'static str },

    #[error("message type must be 'user' or 'ai', got '{0}'")]
    InvalidMessageType(String),

    #[error("invalid frame: {0}")]
    MalformedFrame(String),
}

/// Errors from the text-generation collaborator.
#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("Text generation timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Text generation failed: {0}")]
    Upstream(#[source] anyhow::Error),

    #[error("Text generation returned no content")]
    EmptyResponse,
}

/// Errors from the client's live session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection rejected: {0}")]
    Rejected(Rejection),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No live session")]
    NotConnected,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
