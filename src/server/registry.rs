use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use commsync_common::{ParticipantId, RoomId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of each session's outbound frame queue.
pub const OUTBOX_CAPACITY: usize = 256;

/// Outbound frame queue of one live session. Frames are serialized once and
/// shared between every recipient.
pub type Outbox = mpsc::Sender<Arc<str>>;

pub type SessionId = Uuid;

#[derive(Debug, Clone)]
struct Member {
    participant: ParticipantId,
    outbox: Outbox,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Members whose queue was full or closed; the frame is gone for them.
    pub dropped: usize,
}

/// Live membership of every room: room id → session id → member.
///
/// Mutated only by [`join`](Self::join) and [`leave`](Self::leave). Rooms
/// with no members are pruned; the room itself lives on in the store.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, HashMap<SessionId, Member>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<RoomId, HashMap<SessionId, Member>>> {
        // Entries are plain data; a panic mid-update cannot leave them half-written.
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session in `room` and return its id.
    pub fn join(&self, room: RoomId, participant: ParticipantId, outbox: Outbox) -> SessionId {
        let session_id = Uuid::new_v4();
        self.rooms()
            .entry(room)
            .or_default()
            .insert(session_id, Member { participant, outbox });
        debug!(room = %room, session = %session_id, "Session joined room");
        session_id
    }

    /// Remove a session. Returns false if it was not a member.
    pub fn leave(&self, room: RoomId, session_id: SessionId) -> bool {
        let mut rooms = self.rooms();
        let Some(members) = rooms.get_mut(&room) else {
            return false;
        };
        let removed = members.remove(&session_id).is_some();
        if members.is_empty() {
            rooms.remove(&room);
        }
        if removed {
            debug!(room = %room, session = %session_id, "Session left room");
        }
        removed
    }

    pub fn is_member(&self, room: RoomId, session_id: SessionId) -> bool {
        self.rooms()
            .get(&room)
            .is_some_and(|members| members.contains_key(&session_id))
    }

    pub fn member_count(&self, room: RoomId) -> usize {
        self.rooms().get(&room).map_or(0, HashMap::len)
    }

    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    /// Queue `frame` for every member of `room` except `except`.
    ///
    /// Never waits: a member whose queue is full or closed misses the frame.
    pub fn deliver(&self, room: RoomId, frame: Arc<str>, except: Option<SessionId>) -> Delivery {
        let rooms = self.rooms();
        let mut report = Delivery::default();
        let Some(members) = rooms.get(&room) else {
            return report;
        };
        for (session_id, member) in members {
            if Some(*session_id) == except {
                continue;
            }
            match member.outbox.try_send(Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(room = %room, session = %session_id, participant = %member.participant, "Outbox full, dropping frame");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(room = %room, session = %session_id, participant = %member.participant, "Outbox closed, dropping frame");
                    report.dropped += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room(id: i64) -> RoomId {
        RoomId::new(id).unwrap()
    }

    fn user(id: &str) -> ParticipantId {
        ParticipantId::user(id).unwrap()
    }

    #[test]
    fn test_join_and_leave() {
        let registry = RoomRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let sid = registry.join(room(1), user("a"), tx);
        assert!(registry.is_member(room(1), sid));
        assert_eq!(registry.member_count(room(1)), 1);

        assert!(registry.leave(room(1), sid));
        assert!(!registry.is_member(room(1), sid));
        assert_eq!(registry.room_count(), 0);
        assert!(!registry.leave(room(1), sid));
    }

    #[tokio::test]
    async fn test_deliver_skips_originator() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = registry.join(room(1), user("a"), tx_a);
        registry.join(room(1), user("b"), tx_b);

        let report = registry.deliver(room(1), Arc::from("frame"), Some(a));
        assert_eq!(report, Delivery { delivered: 1, dropped: 0 });
        assert_eq!(&*rx_b.recv().await.unwrap(), "frame");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deliver_is_scoped_to_room() {
        let registry = RoomRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        registry.join(room(1), user("a"), tx_a);
        registry.join(room(2), user("b"), tx_b);

        registry.deliver(room(1), Arc::from("only-room-1"), None);
        assert_eq!(&*rx_a.recv().await.unwrap(), "only-room-1");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_full_or_closed_outbox_drops_without_blocking() {
        let registry = RoomRegistry::new();
        let (tx_full, _rx_full) = mpsc::channel(1);
        let (tx_closed, rx_closed) = mpsc::channel(1);
        drop(rx_closed);
        registry.join(room(1), user("a"), tx_full);
        registry.join(room(1), user("b"), tx_closed);

        let first = registry.deliver(room(1), Arc::from("1"), None);
        assert_eq!(first, Delivery { delivered: 1, dropped: 1 });
        let second = registry.deliver(room(1), Arc::from("2"), None);
        assert_eq!(second, Delivery { delivered: 0, dropped: 2 });
    }

    #[test]
    fn test_deliver_to_empty_room() {
        let registry = RoomRegistry::new();
        assert_eq!(registry.deliver(room(5), Arc::from("x"), None), Delivery::default());
    }
}
