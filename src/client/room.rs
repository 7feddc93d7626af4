use anyhow::Result;
use chrono::Utc;
use commsync_common::{Message, OutgoingMessage, RoomId, Sender};
use tracing::{debug, warn};

use super::cache::ReconciliationCache;
use super::history::HistoryClient;
use super::session::SessionManager;
use crate::config::ClientConfig;
use crate::errors::SessionError;

/// One client's view of a room: the reconciled log plus live updates.
pub struct RoomView {
    room: RoomId,
    me: Sender,
    cache: ReconciliationCache,
}

impl RoomView {
    /// Load the cached log and fetch the server's log concurrently, merge
    /// them, and write the result back. A failed fetch leaves the cached
    /// log as the view.
    pub async fn enter(config: &ClientConfig, room: RoomId, me: Sender) -> Result<Self> {
        let history = HistoryClient::new(config);
        let (cached, fetched) = tokio::join!(
            ReconciliationCache::load(&config.cache_dir, room),
            history.fetch(room)
        );
        let mut cache = cached?;
        match fetched {
            Ok(page) => {
                let added = cache.reconcile(&page.messages);
                cache.save().await?;
                debug!(room = %room, added, total = cache.messages().len(), "Room log reconciled");
            }
            Err(e) => warn!(room = %room, error = %e, "History fetch failed, showing cached messages"),
        }
        Ok(Self { room, me, cache })
    }

    pub fn room(&self) -> RoomId {
        self.room
    }

    /// Oldest first.
    pub fn messages(&self) -> &[Message] {
        self.cache.messages()
    }

    /// Apply a message received over the live channel. Echoes of this
    /// client's own messages are dropped (they were appended optimistically);
    /// assistant replies are always kept. Returns whether the view changed.
    pub async fn on_live(&mut self, message: Message) -> Result<bool> {
        if !message.sender.participant_id.is_assistant()
            && message.sender.participant_id == self.me.participant_id
        {
            return Ok(false);
        }
        self.cache.append_live(message);
        self.cache.save().await?;
        Ok(true)
    }

    /// Append `outgoing` locally, then publish it on the live session.
    pub async fn send(
        &mut self,
        session: &SessionManager,
        outgoing: OutgoingMessage,
    ) -> Result<(), SessionError> {
        let local = Message {
            id: None,
            body: outgoing.body.clone(),
            sender: self.me.clone(),
            timestamp: commsync_common::normalize_timestamp(Utc::now()),
            kind: outgoing.kind,
            file: outgoing.file.clone(),
        };
        self.cache.append_live(local);
        self.cache.save().await?;
        session.publish(outgoing).await
    }

    /// Drop one of this client's own file shares from the local view only.
    pub async fn delete_local(&mut self, index: usize) -> Result<Option<Message>> {
        let removed = self.cache.delete_local(index, &self.me.participant_id);
        if removed.is_some() {
            self.cache.save().await?;
        }
        Ok(removed)
    }
}
