use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved participant id for assistant-authored messages.
pub const ASSISTANT_ID: &str = "ai";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("room id must be a positive integer, got '{0}'")]
    InvalidRoom(String),

    #[error("participant id must not be empty")]
    EmptyParticipant,

    #[error("participant id '{0}' is reserved")]
    ReservedParticipant(String),
}

/// Identifier of a room. Rooms map 1:1 onto projects, so this is the
/// project's primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct RoomId(i64);

impl RoomId {
    pub fn new(id: i64) -> Result<Self, IdError> {
        if id > 0 {
            Ok(Self(id))
        } else {
            Err(IdError::InvalidRoom(id.to_string()))
        }
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl TryFrom<i64> for RoomId {
    type Error = IdError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for i64 {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl FromStr for RoomId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // Reject "+5" and similar forms that i64::from_str would accept.
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdError::InvalidRoom(s.to_string()));
        }
        let id = trimmed
            .parse::<i64>()
            .map_err(|_| IdError::InvalidRoom(s.to_string()))?;
        Self::new(id)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a participant: a real user id or the assistant sentinel.
///
/// Deserialization accepts the sentinel because assistant messages carry it
/// on the wire. Use [`ParticipantId::user`] when minting ids for people.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    /// A real user's id. Empty ids and the assistant sentinel are refused.
    pub fn user(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::EmptyParticipant);
        }
        if id == ASSISTANT_ID {
            return Err(IdError::ReservedParticipant(id));
        }
        Ok(Self(id))
    }

    pub fn assistant() -> Self {
        Self(ASSISTANT_ID.to_string())
    }

    pub fn is_assistant(&self) -> bool {
        self.0 == ASSISTANT_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(IdError::EmptyParticipant)
        } else {
            Ok(Self(value))
        }
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
