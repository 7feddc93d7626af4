//! Live room session over WebSocket.
//!
//! [`SessionManager`] owns at most one [`LiveSession`]. Connecting always
//! closes the previous session first, so a client never holds two
//! memberships that would both receive the same broadcast.

use std::time::Duration;

use commsync_common::{ClientEvent, OutgoingMessage, Rejection, RoomId, ServerEvent};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::errors::SessionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the inbound event queue handed to the caller.
pub const EVENT_CAPACITY: usize = 256;

/// How long [`LiveSession::close`] waits for the server's close frame.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct LiveSession {
    room: RoomId,
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
    reader: JoinHandle<()>,
}

impl LiveSession {
    /// Open a session to `room`. Server events arrive on the returned receiver
    /// until the connection ends.
    pub async fn connect(
        config: &ClientConfig,
        room: RoomId,
    ) -> Result<(Self, mpsc::Receiver<ServerEvent>), SessionError> {
        let url = format!("{}?projectId={}", config.ws_url(), room);
        let mut request = url
            .into_client_request()
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        if !config.token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", config.token))
                .map_err(|_| SessionError::Rejected(Rejection::InvalidCredential))?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify_connect_error)?;
        let (sink, mut source) = stream.split();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                        Ok(event) => {
                            if events_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(room = %room, error = %e, "Ignoring unrecognized server frame"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(room = %room, error = %e, "Live session transport ended");
                        break;
                    }
                }
            }
        });

        info!(room = %room, "Live session established");
        Ok((
            Self {
                room,
                sink: Mutex::new(sink),
                reader,
            },
            events_rx,
        ))
    }

    pub fn room(&self) -> RoomId {
        self.room
    }

    /// Fire-and-forget publish; refusals come back as `error` events.
    pub async fn publish(&self, outgoing: OutgoingMessage) -> Result<(), SessionError> {
        let json = serde_json::to_string(&ClientEvent::RoomMessage(outgoing))
            .map_err(|e| SessionError::Other(e.into()))?;
        self.sink
            .lock()
            .await
            .send(WsMessage::text(json))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    /// Send a close frame and wait, up to [`CLOSE_TIMEOUT`], for the server
    /// to acknowledge it. Once this returns after an acknowledgement the
    /// server no longer counts this session as a room member.
    pub async fn close(self) {
        let mut this = self;
        if let Err(e) = this.sink.lock().await.close().await {
            debug!(room = %this.room, error = %e, "Close frame not delivered");
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut this.reader).await.is_err() {
            debug!(room = %this.room, "Close not acknowledged in time");
        }
        info!(room = %this.room, "Live session closed");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Map a failed handshake to a categorized rejection when the server sent one.
fn classify_connect_error(err: WsError) -> SessionError {
    if let WsError::Http(response) = &err {
        if let Some(rejection) = rejection_from_body(response.body().as_deref()) {
            return SessionError::Rejected(rejection);
        }
        return SessionError::Transport(format!("handshake failed with status {}", response.status()));
    }
    SessionError::Transport(err.to_string())
}

/// Read the `{"error": <code>}` body of a refused upgrade.
fn rejection_from_body(body: Option<&[u8]>) -> Option<Rejection> {
    let value: serde_json::Value = serde_json::from_slice(body?).ok()?;
    Rejection::from_code(value.get("error")?.as_str()?)
}

/// Owns the client's single live session.
pub struct SessionManager {
    config: ClientConfig,
    current: Option<LiveSession>,
}

impl SessionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            current: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Close any current session, then connect to `room`.
    pub async fn connect(&mut self, room: RoomId) -> Result<mpsc::Receiver<ServerEvent>, SessionError> {
        self.disconnect().await;
        let (session, events) = LiveSession::connect(&self.config, room).await?;
        self.current = Some(session);
        Ok(events)
    }

    pub async fn disconnect(&mut self) {
        if let Some(session) = self.current.take() {
            session.close().await;
        }
    }

    pub fn current(&self) -> Option<&LiveSession> {
        self.current.as_ref()
    }

    pub async fn publish(&self, outgoing: OutgoingMessage) -> Result<(), SessionError> {
        self.current
            .as_ref()
            .ok_or(SessionError::NotConnected)?
            .publish(outgoing)
            .await
    }
}
