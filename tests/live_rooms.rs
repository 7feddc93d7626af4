//! End-to-end tests: a real server on a loopback port driven by the client
//! runtime over WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use commsync::client::{HistoryClient, RoomView, SessionManager};
use commsync::config::{ClientConfig, ServerConfig};
use commsync::errors::SessionError;
use commsync::server::assistant::{AssistantPipeline, StaticGenerator, TextGenerator};
use commsync::server::db::{DbHandle, RoomDb};
use commsync::server::gatekeeper::CredentialVerifier;
use commsync::server::{AppState, SharedState, build_router, serve};
use commsync_common::{
    AssistantReply, FileMeta, Message, MessageKind, MessagePayload, OutgoingMessage,
    ParticipantId, Rejection, RoomId, Sender, ServerEvent,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

const SECRET: &str = "live-test-secret";
const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(400);

struct SlowGenerator;

#[async_trait]
impl TextGenerator for SlowGenerator {
    async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok("never".into())
    }
}

struct TestServer {
    addr: SocketAddr,
    state: SharedState,
    room: RoomId,
    cache_dir: TempDir,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    async fn start(assistant: Option<AssistantPipeline>) -> Self {
        let db = DbHandle::new(RoomDb::new_in_memory().unwrap());
        let project = db
            .call(|db| {
                let p = db.create_project("live", &ParticipantId::user("alice")?)?;
                db.add_members(p.id, &[ParticipantId::user("bob")?])
            })
            .await
            .unwrap();
        let state = Arc::new(AppState::new(db, CredentialVerifier::new(SECRET), assistant));
        let app = build_router(state.clone(), &ServerConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, app, async {
            let _ = rx.await;
        }));

        Self {
            addr,
            state,
            room: RoomId::new(project.id).unwrap(),
            cache_dir: TempDir::new().unwrap(),
            _shutdown: tx,
        }
    }

    fn config(&self, user: &str) -> ClientConfig {
        let token = CredentialVerifier::new(SECRET)
            .issue(&ParticipantId::user(user).unwrap(), user, chrono::Duration::hours(1))
            .unwrap();
        self.config_with_token(&token)
            .with_cache_dir(self.cache_dir.path().join(user))
    }

    fn config_with_token(&self, token: &str) -> ClientConfig {
        ClientConfig::new(format!("http://{}", self.addr), token)
    }

    async fn wait_for_members(&self, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while self.state.registry().member_count(self.room) != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room membership did not settle");
    }

    async fn log(&self) -> Vec<Message> {
        self.state
            .store
            .list_by_room(self.room, &ParticipantId::user("alice").unwrap())
            .await
            .unwrap()
    }

    async fn wait_for_log_len(&self, expected: usize) {
        tokio::time::timeout(WAIT, async {
            while self.log().await.len() < expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("room log did not grow");
    }

    /// Connect `user` and wait until the server has registered the session.
    async fn join(&self, user: &str) -> (SessionManager, mpsc::Receiver<ServerEvent>) {
        let before = self.state.registry().member_count(self.room);
        let mut manager = SessionManager::new(self.config(user));
        let events = manager.connect(self.room).await.unwrap();
        self.wait_for_members(before + 1).await;
        (manager, events)
    }
}

async fn next_event(events: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("session closed")
}

async fn next_message(events: &mut mpsc::Receiver<ServerEvent>) -> Message {
    match next_event(events).await {
        ServerEvent::RoomMessage(m) => m,
        other => panic!("expected room-message, got {:?}", other),
    }
}

async fn assert_quiet(events: &mut mpsc::Receiver<ServerEvent>) {
    if let Ok(Some(event)) = tokio::time::timeout(QUIET, events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

fn pipeline(generator: impl TextGenerator + 'static, timeout: Duration) -> Option<AssistantPipeline> {
    Some(AssistantPipeline::new(Arc::new(generator), timeout))
}

#[tokio::test]
async fn test_fan_out_keeps_order_and_never_echoes() {
    let server = TestServer::start(None).await;
    let (alice, mut alice_events) = server.join("alice").await;
    let (_bob, mut bob_events) = server.join("bob").await;

    for i in 0..5 {
        alice.publish(OutgoingMessage::text(format!("msg {}", i))).await.unwrap();
    }
    for i in 0..5 {
        let m = next_message(&mut bob_events).await;
        assert_eq!(m.body, format!("msg {}", i));
        assert_eq!(m.sender.participant_id.as_str(), "alice");
        assert!(m.id.is_some());
    }
    assert_quiet(&mut alice_events).await;

    let log = server.log().await;
    let bodies: Vec<&str> = log.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, ["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
}

#[tokio::test]
async fn test_assistant_reply_reaches_requester_and_room() {
    let server = TestServer::start(pipeline(StaticGenerator::new("42"), WAIT)).await;
    let (alice, mut alice_events) = server.join("alice").await;
    let (_bob, mut bob_events) = server.join("bob").await;

    alice.publish(OutgoingMessage::text("hello @ai")).await.unwrap();

    let original = next_message(&mut bob_events).await;
    assert_eq!(original.body, "hello @ai");
    assert_eq!(original.sender.participant_id.as_str(), "alice");

    for events in [&mut alice_events, &mut bob_events] {
        let reply = next_message(events).await;
        assert_eq!(reply.kind, MessageKind::AssistantText);
        assert!(reply.sender.participant_id.is_assistant());
        assert_eq!(reply.payload(), MessagePayload::Assistant(AssistantReply::plain("42")));
        assert_quiet(events).await;
    }

    let log = server.log().await;
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].kind, MessageKind::AssistantText);
}

#[tokio::test]
async fn test_assistant_timeout_emits_nothing() {
    let server = TestServer::start(pipeline(SlowGenerator, Duration::from_millis(100))).await;
    let (alice, mut alice_events) = server.join("alice").await;
    let (_bob, mut bob_events) = server.join("bob").await;

    alice.publish(OutgoingMessage::text("@ai are you there")).await.unwrap();
    assert_eq!(next_message(&mut bob_events).await.body, "@ai are you there");

    assert_quiet(&mut bob_events).await;
    assert_quiet(&mut alice_events).await;

    let log = server.log().await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].body, "@ai are you there");
}

#[tokio::test]
async fn test_invalid_payload_answered_to_sender_only() {
    let server = TestServer::start(None).await;
    let (alice, mut alice_events) = server.join("alice").await;
    let (_bob, mut bob_events) = server.join("bob").await;

    alice.publish(OutgoingMessage::text("   ")).await.unwrap();
    match next_event(&mut alice_events).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, "validation"),
        other => panic!("expected error event, got {:?}", other),
    }
    assert_quiet(&mut bob_events).await;
    assert!(server.log().await.is_empty());
}

#[tokio::test]
async fn test_rejected_connections_never_join() {
    let server = TestServer::start(None).await;

    let missing_room = RoomId::new(9_999).unwrap();
    let mut manager = SessionManager::new(server.config("alice"));
    let err = manager.connect(missing_room).await.unwrap_err();
    assert!(matches!(err, SessionError::Rejected(Rejection::InvalidRoom)));

    let mut manager = SessionManager::new(server.config_with_token(""));
    let err = manager.connect(server.room).await.unwrap_err();
    assert!(matches!(err, SessionError::Rejected(Rejection::MissingCredential)));

    let mut manager = SessionManager::new(server.config_with_token("forged.token.value"));
    let err = manager.connect(server.room).await.unwrap_err();
    assert!(matches!(err, SessionError::Rejected(Rejection::InvalidCredential)));

    let url = format!("ws://{}/ws?projectId=not-a-number", server.addr);
    match tokio_tungstenite::connect_async(url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 400);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("malformed room id was admitted"),
    }

    assert_eq!(server.state.registry().room_count(), 0);
}

#[tokio::test]
async fn test_reconnect_replaces_previous_session() {
    let server = TestServer::start(None).await;
    let (mut alice, _first) = server.join("alice").await;

    let _second = alice.connect(server.room).await.unwrap();
    // The old membership is gone by the time connect returns.
    assert!(server.state.registry().member_count(server.room) <= 1);
    server.wait_for_members(1).await;
    assert!(alice.current().is_some_and(|s| s.room() == server.room));

    alice.disconnect().await;
    assert_eq!(server.state.registry().member_count(server.room), 0);
    assert_eq!(server.state.registry().room_count(), 0);
}

#[tokio::test]
async fn test_posted_message_is_stored_but_not_broadcast() {
    let server = TestServer::start(pipeline(StaticGenerator::new("unused"), WAIT)).await;
    let (_alice, mut alice_events) = server.join("alice").await;
    let (_bob, mut bob_events) = server.join("bob").await;

    let stored = HistoryClient::new(&server.config("alice"))
        .post_message(server.room, "@ai written offline")
        .await
        .unwrap();
    assert!(stored.id.is_some());
    assert_eq!(stored.sender.participant_id.as_str(), "alice");

    assert_quiet(&mut bob_events).await;
    assert_quiet(&mut alice_events).await;
    assert_eq!(server.log().await.len(), 1);

    let bob_me = Sender::new(ParticipantId::user("bob").unwrap(), "bob");
    let view = RoomView::enter(&server.config("bob"), server.room, bob_me).await.unwrap();
    assert_eq!(view.messages().len(), 1);
    assert_eq!(view.messages()[0].body, "@ai written offline");
}

#[tokio::test]
async fn test_room_view_deletes_own_file_share_locally() {
    let server = TestServer::start(None).await;
    HistoryClient::new(&server.config("bob"))
        .post_message(server.room, "from bob")
        .await
        .unwrap();

    let me = Sender::new(ParticipantId::user("alice").unwrap(), "alice");
    let config = server.config("alice");
    let (session, _events) = server.join("alice").await;
    let mut view = RoomView::enter(&config, server.room, me.clone()).await.unwrap();

    let file = FileMeta {
        name: "plan.pdf".into(),
        storage_key: "rooms/plan.pdf".into(),
        external_url: "https://files.example/rooms/plan.pdf".into(),
        size_bytes: 2048,
        mime_type: "application/pdf".into(),
    };
    view.send(&session, OutgoingMessage::file("plan.pdf", file)).await.unwrap();
    assert_eq!(view.messages().len(), 2);

    assert!(view.delete_local(0).await.unwrap().is_none());
    let removed = view.delete_local(1).await.unwrap().unwrap();
    assert_eq!(removed.kind, MessageKind::FileShare);
    let bodies: Vec<&str> = view.messages().iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, ["from bob"]);

    // Local only: the room log keeps the share and a fresh view restores it.
    server.wait_for_log_len(2).await;
    let reopened = RoomView::enter(&config, server.room, me).await.unwrap();
    let kinds: Vec<MessageKind> = reopened.messages().iter().map(|m| m.kind).collect();
    assert_eq!(kinds, [MessageKind::UserText, MessageKind::FileShare]);
}

#[tokio::test]
async fn test_room_view_does_not_duplicate_optimistic_messages() {
    let server = TestServer::start(None).await;
    let me = Sender::new(ParticipantId::user("alice").unwrap(), "alice");
    let config = server.config("alice");

    let (session, _events) = server.join("alice").await;
    let mut view = RoomView::enter(&config, server.room, me.clone()).await.unwrap();
    assert!(view.messages().is_empty());

    view.send(&session, OutgoingMessage::text("draft")).await.unwrap();
    assert_eq!(view.messages().len(), 1);
    server.wait_for_log_len(1).await;

    // Own echo is ignored; the persisted copy is folded into the cached one.
    let persisted = server.log().await.remove(0);
    assert!(!view.on_live(persisted).await.unwrap());

    let reopened = RoomView::enter(&config, server.room, me).await.unwrap();
    assert_eq!(reopened.messages().len(), 1);
    assert_eq!(reopened.messages()[0].body, "draft");
}

#[tokio::test]
async fn test_room_view_for_second_member() {
    let server = TestServer::start(pipeline(StaticGenerator::new("sure"), WAIT)).await;
    let (alice, _alice_events) = server.join("alice").await;
    let (_bob_session, mut bob_events) = server.join("bob").await;
    let bob_me = Sender::new(ParticipantId::user("bob").unwrap(), "bob");
    let mut bob_view = RoomView::enter(&server.config("bob"), server.room, bob_me)
        .await
        .unwrap();

    alice.publish(OutgoingMessage::text("@ai summarize")).await.unwrap();
    for _ in 0..2 {
        let m = next_message(&mut bob_events).await;
        assert!(bob_view.on_live(m).await.unwrap());
    }
    let kinds: Vec<MessageKind> = bob_view.messages().iter().map(|m| m.kind).collect();
    assert_eq!(kinds, [MessageKind::UserText, MessageKind::AssistantText]);
}
