use chrono::Utc;
use commsync_common::{Message, ParticipantId, RoomId, normalize_timestamp};
use tracing::debug;

use super::db::DbHandle;
use super::locks::RoomLocks;
use crate::errors::StoreError;

/// Who is asking the store to act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// A participant; must belong to the room's project.
    Member(ParticipantId),
    /// The assistant pipeline answering `requester`. The reply is written
    /// only while `requester` belongs to the room's project.
    Assistant { requester: ParticipantId },
}

impl Caller {
    fn participant(&self) -> &ParticipantId {
        match self {
            Caller::Member(user) => user,
            Caller::Assistant { requester } => requester,
        }
    }
}

/// Persistent, append-only message log partitioned by room.
///
/// Appends to the same room are serialized through a per-room lock, so ids
/// and timestamps of record are assigned in one total order per room. Reads
/// never take the lock: SQLite hands back either the pre- or post-append
/// state.
#[derive(Clone)]
pub struct MessageStore {
    db: DbHandle,
    writers: RoomLocks,
}

impl MessageStore {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            writers: RoomLocks::new(),
        }
    }

    /// Append `message` to `room`, assigning its id and timestamp of record.
    ///
    /// Timestamps of record never go backwards within a room, so timestamp
    /// order and insertion order agree even if the wall clock steps back.
    pub async fn append(
        &self,
        room: RoomId,
        caller: &Caller,
        message: Message,
    ) -> Result<Message, StoreError> {
        // Writer locks exist only for real rooms.
        let exists = self
            .db
            .call(move |db| db.project_exists(room.get()))
            .await
            .map_err(StoreError::Database)?;
        if !exists {
            return Err(StoreError::RoomNotFound { room });
        }

        let _writer = self.writers.acquire(room).await;
        let user = caller.participant().clone();

        let outcome = self
            .db
            .call(move |db| {
                if !db.project_exists(room.get())? {
                    return Ok(Err(StoreError::RoomNotFound { room }));
                }
                if !db.is_member(room.get(), &user)? {
                    return Ok(Err(StoreError::AccessDenied { room }));
                }
                let mut stored = message;
                let now = normalize_timestamp(Utc::now());
                stored.timestamp = match db.last_message_timestamp(room)? {
                    Some(last) if last > now => last,
                    _ => now,
                };
                let id = db.insert_message(room, &stored)?;
                stored.id = Some(id);
                Ok(Ok(stored))
            })
            .await
            .map_err(StoreError::Database)?;

        if let Ok(stored) = &outcome {
            debug!(room = %room, message_id = ?stored.id, kind = stored.kind.as_str(), "Message appended");
        }
        outcome
    }

    /// Every message in `room`, in insertion order.
    pub async fn list_by_room(
        &self,
        room: RoomId,
        caller: &ParticipantId,
    ) -> Result<Vec<Message>, StoreError> {
        let caller = caller.clone();
        self.db
            .call(move |db| {
                if !db.project_exists(room.get())? {
                    return Ok(Err(StoreError::RoomNotFound { room }));
                }
                if !db.is_member(room.get(), &caller)? {
                    return Ok(Err(StoreError::AccessDenied { room }));
                }
                Ok(Ok(db.list_messages(room)?))
            })
            .await
            .map_err(StoreError::Database)?
    }
}

/// Reorder a room log newest-first. Equal timestamps keep the later arrival first.
pub fn newest_first(mut messages: Vec<Message>) -> Vec<Message> {
    messages.reverse();
    messages.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    messages
}
