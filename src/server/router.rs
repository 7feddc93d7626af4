//! Broadcast Router.
//!
//! Publishing runs under a per-room sequencing lock: persist (best-effort),
//! then fan out to every other member. The order in which publishes take the
//! lock is therefore the order persisted and the order delivered. A message
//! addressed to the assistant forks a detached task that generates a reply
//! outside the lock and then persists and delivers it to the whole room under
//! the same lock.

use std::sync::Arc;

use chrono::Utc;
use commsync_common::{
    MAX_BODY_CHARS, Message, MessageKind, OutgoingMessage, ParticipantId, RoomId, ServerEvent,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::assistant::AssistantPipeline;
use super::locks::RoomLocks;
use super::models::Identity;
use super::registry::{Delivery, RoomRegistry, SessionId};
use super::store::{Caller, MessageStore};
use crate::errors::{StoreError, ValidationError};

/// Result of one accepted publish.
#[derive(Debug)]
pub struct PublishOutcome {
    /// What was delivered: the stored form, or the unpersisted form when the
    /// store write failed.
    pub message: Message,
    pub persisted: bool,
    pub delivery: Delivery,
    /// The detached assistant task, when the message addressed it.
    pub assistant: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct BroadcastRouter {
    registry: Arc<RoomRegistry>,
    store: MessageStore,
    sequencer: RoomLocks,
    assistant: Option<AssistantPipeline>,
}

impl BroadcastRouter {
    pub fn new(
        registry: Arc<RoomRegistry>,
        store: MessageStore,
        assistant: Option<AssistantPipeline>,
    ) -> Self {
        Self {
            registry,
            store,
            sequencer: RoomLocks::new(),
            assistant,
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Publish a message from session `origin` in `room`.
    ///
    /// Validation failures are returned before anything is persisted or sent.
    pub async fn publish(
        &self,
        room: RoomId,
        origin: SessionId,
        identity: &Identity,
        outgoing: OutgoingMessage,
    ) -> Result<PublishOutcome, ValidationError> {
        let draft = validate(identity, outgoing)?;
        let caller = Caller::Member(identity.participant_id.clone());

        let (message, persisted, refused, delivery) = {
            let _turn = self.sequencer.acquire(room).await;
            let (message, persisted, refused) =
                match self.store.append(room, &caller, draft.clone()).await {
                    Ok(stored) => (stored, true, false),
                    Err(e) => {
                        warn!(room = %room, sender = %identity.participant_id, error = %e, "Failed to persist message, delivering anyway");
                        let refused = matches!(
                            e,
                            StoreError::AccessDenied { .. } | StoreError::RoomNotFound { .. }
                        );
                        (draft, false, refused)
                    }
                };
            let event = ServerEvent::RoomMessage(message.clone());
            let delivery = broadcast_message(&self.registry, room, &event, Some(origin));
            (message, persisted, refused, delivery)
        };
        debug!(
            room = %room,
            message_id = ?message.id,
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            "Message published"
        );

        // A publisher the store refused gets no assistant reply.
        let assistant = if message.addresses_assistant() && !refused {
            self.spawn_assistant(room, identity.participant_id.clone(), message.assistant_prompt())
        } else {
            None
        };

        Ok(PublishOutcome {
            message,
            persisted,
            delivery,
            assistant,
        })
    }

    fn spawn_assistant(
        &self,
        room: RoomId,
        requester: ParticipantId,
        prompt: String,
    ) -> Option<JoinHandle<()>> {
        let Some(pipeline) = self.assistant.clone() else {
            debug!(room = %room, "Message addresses the assistant but none is configured");
            return None;
        };
        let router = self.clone();
        Some(tokio::spawn(async move {
            router.run_assistant(room, requester, &pipeline, &prompt).await;
        }))
    }

    async fn run_assistant(
        &self,
        room: RoomId,
        requester: ParticipantId,
        pipeline: &AssistantPipeline,
        prompt: &str,
    ) {
        let reply = match pipeline.respond(prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(room = %room, error = %e, "Assistant produced no reply");
                return;
            }
        };

        let _turn = self.sequencer.acquire(room).await;
        let draft = Message::assistant(&reply, Utc::now());
        let caller = Caller::Assistant { requester };
        let message = match self.store.append(room, &caller, draft.clone()).await {
            Ok(stored) => stored,
            Err(e @ (StoreError::AccessDenied { .. } | StoreError::RoomNotFound { .. })) => {
                warn!(room = %room, error = %e, "Requester can no longer write to the room, dropping assistant reply");
                return;
            }
            Err(e) => {
                error!(room = %room, error = %e, "Failed to persist assistant reply, delivering anyway");
                draft
            }
        };
        let delivery = broadcast_message(&self.registry, room, &ServerEvent::RoomMessage(message), None);
        info!(room = %room, delivered = delivery.delivered, "Assistant reply delivered");
    }
}

/// Check a client payload and stamp it with the publisher's identity.
pub fn validate(identity: &Identity, outgoing: OutgoingMessage) -> Result<Message, ValidationError> {
    let OutgoingMessage { body, kind, file } = outgoing;
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    let len = body.chars().count();
    if len > MAX_BODY_CHARS {
        return Err(ValidationError::BodyTooLong { len });
    }
    let sender = identity.sender();
    let now = Utc::now();
    match kind {
        MessageKind::UserText => Ok(Message::user_text(sender, body, now)),
        MessageKind::FileShare => {
            let file = file.ok_or(ValidationError::MissingFile)?;
            Ok(Message::file_share(sender, body, file, now))
        }
        MessageKind::AssistantText => Err(ValidationError::ReservedKind {
            kind: MessageKind::AssistantText.as_str(),
        }),
    }
}

/// Serialize `event` once and queue it for the room's members.
pub fn broadcast_message(
    registry: &RoomRegistry,
    room: RoomId,
    event: &ServerEvent,
    except: Option<SessionId>,
) -> Delivery {
    match serde_json::to_string(event) {
        Ok(json) => registry.deliver(room, Arc::from(json), except),
        Err(e) => {
            error!(room = %room, error = %e, "Failed to serialize server event");
            Delivery::default()
        }
    }
}
