use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        Query, State,
        ws::{Message as WsFrame, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use commsync_common::{ClientEvent, RoomId, ServerEvent};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::{ApiError, AppState};
use super::gatekeeper::{Admission, bearer_token};
use super::models::Identity;
use super::registry::{OUTBOX_CAPACITY, SessionId};
use super::router::BroadcastRouter;
use crate::errors::ValidationError;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection metadata carried on the upgrade request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub project_id: Option<String>,
    /// Fallback for clients that cannot set an `Authorization` header.
    pub token: Option<String>,
}

// ── WebSocket handler ────────────────────────────────────────────────

/// Gate the connection, then upgrade. A rejected attempt never reaches the
/// registry and is answered with a plain HTTP error carrying the rejection code.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Response {
    let credential = bearer_token(&headers).or(params.token.as_deref());
    match state
        .gatekeeper
        .admit(params.project_id.as_deref(), credential)
        .await
    {
        Ok(admission) => {
            let router = state.router.clone();
            ws.on_upgrade(move |socket| handle_socket(socket, router, admission))
                .into_response()
        }
        Err(rejection) => {
            info!(project_id = ?params.project_id, code = rejection.code(), "Connection rejected");
            ApiError::from(rejection).into_response()
        }
    }
}

/// A joined connection.
struct Session {
    router: BroadcastRouter,
    room: RoomId,
    id: SessionId,
    identity: Identity,
}

async fn handle_socket(socket: WebSocket, router: BroadcastRouter, admission: Admission) {
    let Admission { room, identity } = admission;
    let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);
    let id = router
        .registry()
        .join(room, identity.participant_id.clone(), outbox);
    info!(room = %room, session = %id, participant = %identity.participant_id, "Participant joined");

    let session = Session {
        router,
        room,
        id,
        identity,
    };
    let (mut sender, receiver) = socket.split();
    run_socket_loop(&mut sender, receiver, rx, &session).await;

    // Membership is gone before the client sees our close frame.
    session.router.registry().leave(room, id);
    info!(room = %room, session = %id, "Participant left");

    // Best-effort close frame; also flushes the reply to a client-initiated close.
    let _ = sender.send(WsFrame::Close(None)).await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Combines outbox forwarding, client frame handling, and periodic ping/pong
/// health checking into a single select loop. If no Pong is received within
/// [`PONG_TIMEOUT`] after a Ping is sent, the connection is considered dead
/// and the loop exits.
async fn run_socket_loop(
    sender: &mut SplitSink<WebSocket, WsFrame>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: mpsc::Receiver<Arc<str>>,
    session: &Session,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(session = %session.id, "Pong timeout, closing");
                    break;
                }
                if sender.send(WsFrame::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Room fan-out ────────────────────────────────────────
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if sender.send(WsFrame::Text((&*frame).into())).await.is_err() {
                    break;
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(WsFrame::Text(text))) => {
                        if let Some(reply) = handle_client_frame(session, text.as_str()).await {
                            if sender.send(WsFrame::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsFrame::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(WsFrame::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session = %session.id, error = %e, "Transport error");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle one client frame. Returns a frame for the originator only when the
/// payload was refused.
async fn handle_client_frame(session: &Session, text: &str) -> Option<String> {
    let outgoing = match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::RoomMessage(outgoing)) => outgoing,
        Err(e) => return Some(error_frame(&ValidationError::MalformedFrame(e.to_string()))),
    };
    match session
        .router
        .publish(session.room, session.id, &session.identity, outgoing)
        .await
    {
        // The assistant task, if any, runs detached from this connection.
        Ok(_) => None,
        Err(e) => {
            warn!(room = %session.room, session = %session.id, error = %e, "Refused client message");
            Some(error_frame(&e))
        }
    }
}

fn error_frame(err: &ValidationError) -> String {
    let event = ServerEvent::Error {
        code: "validation".to_string(),
        message: err.to_string(),
    };
    serde_json::to_string(&event)
        .unwrap_or_else(|_| r#"{"event":"error","data":{"code":"validation","message":""}}"#.to_string())
}

// ── Tests ────────────────────────────────────────────────────────────
