//! Client Reconciliation Cache.
//!
//! A per-room message log kept on disk so a client survives restarts and
//! reconnects. On room entry the cached log is merged with the server's log:
//! a server message counts as already cached when a cached message has the
//! same body, the same sender, and a timestamp less than one second away.
//! That catches the optimistic local copy of a message and the copy the
//! server persisted a few milliseconds later.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use commsync_common::{Message, MessageKind, ParticipantId, RoomId};
use tracing::{debug, warn};

/// Two copies of an event are at most this far apart (exclusive).
pub const TOLERANCE_MS: i64 = 1000;

/// Whether `a` and `b` are copies of the same logical event.
pub fn same_event(a: &Message, b: &Message) -> bool {
    a.body == b.body
        && a.sender.participant_id == b.sender.participant_id
        && (a.timestamp - b.timestamp).num_milliseconds().abs() < TOLERANCE_MS
}

/// Union of `cached` and `server`, deduplicated by [`same_event`] against the
/// cache only, sorted oldest first.
pub fn merge_messages(cached: &[Message], server: &[Message]) -> Vec<Message> {
    let mut merged = cached.to_vec();
    for incoming in server {
        if !cached.iter().any(|c| same_event(c, incoming)) {
            merged.push(incoming.clone());
        }
    }
    merged.sort_by(chronological);
    merged
}

/// Timestamp order; ties fall back to content so the result does not depend
/// on which list a message came from.
fn chronological(a: &Message, b: &Message) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.sender.participant_id.cmp(&b.sender.participant_id))
        .then_with(|| a.body.cmp(&b.body))
}

/// On-disk cache of one room's messages, oldest first.
#[derive(Debug)]
pub struct ReconciliationCache {
    room: RoomId,
    path: PathBuf,
    messages: Vec<Message>,
}

impl ReconciliationCache {
    pub fn file_name(room: RoomId) -> String {
        format!("project_messages_{}.json", room)
    }

    pub fn empty(dir: &Path, room: RoomId) -> Self {
        Self {
            room,
            path: dir.join(Self::file_name(room)),
            messages: Vec::new(),
        }
    }

    /// Load the cache for `room` from `dir`. A missing file is an empty
    /// cache; an unreadable one is discarded with a warning.
    pub async fn load(dir: &Path, room: RoomId) -> Result<Self> {
        let mut cache = Self::empty(dir, room);
        match tokio::fs::read(&cache.path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<Message>>(&bytes) {
                Ok(messages) => cache.messages = messages,
                Err(e) => {
                    warn!(room = %room, path = %cache.path.display(), error = %e, "Discarding unreadable message cache");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read message cache {}", cache.path.display())
                });
            }
        }
        debug!(room = %room, cached = cache.messages.len(), "Message cache loaded");
        Ok(cache)
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create cache directory")?;
        }
        let json = serde_json::to_vec(&self.messages).context("Failed to serialize message cache")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))
    }

    pub fn room(&self) -> RoomId {
        self.room
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Merge the server's log into the cache. Returns how many messages were new.
    pub fn reconcile(&mut self, server: &[Message]) -> usize {
        let before = self.messages.len();
        self.messages = merge_messages(&self.messages, server);
        self.messages.len() - before
    }

    /// Append a message that arrived live, without reconciling.
    pub fn append_live(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Remove the `file-share` message at `index` from this cache only, if
    /// `requester` sent it. The server log and other members are unaffected.
    pub fn delete_local(&mut self, index: usize, requester: &ParticipantId) -> Option<Message> {
        let target = self.messages.get(index)?;
        if target.kind != MessageKind::FileShare || &target.sender.participant_id != requester {
            return None;
        }
        Some(self.messages.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use commsync_common::{FileMeta, Sender};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn msg(from: &str, body: &str, offset_ms: i64) -> Message {
        Message::user_text(
            Sender::new(ParticipantId::user(from).unwrap(), from),
            body,
            base() + Duration::milliseconds(offset_ms),
        )
    }

    fn bodies(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|m| m.body.as_str()).collect()
    }

    #[test]
    fn test_same_event_window() {
        assert!(same_event(&msg("a", "hi", 0), &msg("a", "hi", 999)));
        assert!(same_event(&msg("a", "hi", 999), &msg("a", "hi", 0)));
        assert!(!same_event(&msg("a", "hi", 0), &msg("a", "hi", 1000)));
        assert!(!same_event(&msg("a", "hi", 0), &msg("b", "hi", 0)));
        assert!(!same_event(&msg("a", "hi", 0), &msg("a", "ho", 0)));
    }

    #[test]
    fn test_optimistic_copy_is_not_duplicated() {
        let cached = vec![msg("a", "hello", 0)];
        let mut persisted = msg("a", "hello", 12);
        persisted.id = Some(7);
        let merged = merge_messages(&cached, &[persisted]);
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_two_seconds_apart_are_both_kept() {
        let merged = merge_messages(&[msg("a", "ping", 0)], &[msg("a", "ping", 2000)]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let cached = vec![msg("a", "one", 0), msg("b", "two", 5000)];
        let server = vec![msg("b", "two", 5300), msg("c", "three", 9000), msg("a", "zero", -4000)];
        let once = merge_messages(&cached, &server);
        let twice = merge_messages(&once, &server);
        assert_eq!(once.len(), 4);
        assert_eq!(twice.len(), once.len());
    }

    #[test]
    fn test_merge_is_order_independent_for_equal_content() {
        let left = vec![msg("a", "x", 3000), msg("b", "y", 1000), msg("c", "z", 1000)];
        let mut right = left.clone();
        right.reverse();
        assert_eq!(merge_messages(&left, &right), merge_messages(&right, &left));
        assert_eq!(bodies(&merge_messages(&left, &right)), ["y", "z", "x"]);
    }

    #[test]
    fn test_merge_sorts_ascending() {
        let merged = merge_messages(&[msg("a", "late", 9000)], &[msg("b", "early", 0)]);
        assert_eq!(bodies(&merged), ["early", "late"]);
    }

    #[test]
    fn test_delete_local_only_own_file_shares() {
        let dir = tempfile::tempdir().unwrap();
        let room = RoomId::new(3).unwrap();
        let mut cache = ReconciliationCache::empty(dir.path(), room);
        let me = ParticipantId::user("me").unwrap();
        let file = FileMeta {
            name: "a.png".into(),
            storage_key: "k".into(),
            external_url: "https://files.example/k".into(),
            size_bytes: 10,
            mime_type: "image/png".into(),
        };
        cache.append_live(msg("me", "text", 0));
        cache.append_live(Message::file_share(Sender::new(me.clone(), "me"), "a.png", file.clone(), base()));
        cache.append_live(Message::file_share(
            Sender::new(ParticipantId::user("other").unwrap(), "other"),
            "b.png",
            file,
            base(),
        ));

        assert!(cache.delete_local(0, &me).is_none());
        assert!(cache.delete_local(2, &me).is_none());
        assert!(cache.delete_local(9, &me).is_none());
        assert_eq!(cache.delete_local(1, &me).unwrap().body, "a.png");
        assert_eq!(bodies(cache.messages()), ["text", "b.png"]);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let room = RoomId::new(42).unwrap();

        let empty = ReconciliationCache::load(dir.path(), room).await.unwrap();
        assert!(empty.messages().is_empty());

        let mut cache = ReconciliationCache::empty(dir.path(), room);
        cache.reconcile(&[msg("a", "kept", 0)]);
        cache.save().await.unwrap();
        assert!(dir.path().join("project_messages_42.json").exists());

        let reloaded = ReconciliationCache::load(dir.path(), room).await.unwrap();
        assert_eq!(reloaded.messages(), cache.messages());
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let room = RoomId::new(5).unwrap();
        std::fs::write(dir.path().join(ReconciliationCache::file_name(room)), b"{not json").unwrap();
        let cache = ReconciliationCache::load(dir.path(), room).await.unwrap();
        assert!(cache.messages().is_empty());
    }
}
