//! Shared server state, WebSocket handler, and push fan-out.
//!
//! Every accepted WebSocket gets a connection ID and a writer channel. A
//! socket becomes addressable once it sends a valid `auth` frame; after that
//! `new_message` pushes reach it whenever the other party of one of its
//! sessions writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use deskline_proto::frame::{
    self, AuthFrame, InboundFrame, MessageErrorFrame, MessageSentFrame, NewMessageFrame,
    OutboundFrame, SendMessageFrame,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use crate::auth::{Principal, Role};
use crate::store::{Appended, SessionStore};

/// Close code used by [`ServerState::close_all_connections`]
/// ("service restart"), which clients treat as an abnormal closure.
pub const RESTART_CLOSE_CODE: u16 = 1012;

/// A live WebSocket registered with the hub.
struct Connection {
    principal: Option<Principal>,
    sender: mpsc::UnboundedSender<Message>,
}

/// Shared server state: the session store plus the socket registry.
pub struct ServerState {
    /// Persisted sessions and messages.
    pub store: SessionStore,
    connections: RwLock<HashMap<u64, Connection>>,
    next_id: AtomicU64,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Creates a state with an empty store and no connections.
    #[must_use]
    pub fn new() -> Self {
        Self {
            store: SessionStore::new(),
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers an unauthenticated socket and returns its connection ID.
    async fn register(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections.write().await.insert(
            id,
            Connection {
                principal: None,
                sender,
            },
        );
        id
    }

    async fn unregister(&self, conn_id: u64) {
        self.connections.write().await.remove(&conn_id);
    }

    async fn authenticate(&self, conn_id: u64, principal: Principal) {
        if let Some(conn) = self.connections.write().await.get_mut(&conn_id) {
            conn.principal = Some(principal);
        }
    }

    async fn principal_of(&self, conn_id: u64) -> Option<Principal> {
        self.connections
            .read()
            .await
            .get(&conn_id)
            .and_then(|c| c.principal.clone())
    }

    /// Number of open sockets, authenticated or not.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of sockets authenticated as `principal`.
    pub async fn authenticated_count(&self, principal: &Principal) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.principal.as_ref() == Some(principal))
            .count()
    }

    /// Sends a frame to one socket.
    async fn send_to(&self, conn_id: u64, frame: &InboundFrame) {
        let Some(text) = encode(frame) else { return };
        if let Some(conn) = self.connections.read().await.get(&conn_id) {
            let _ = conn.sender.send(Message::Text(text.into()));
        }
    }

    /// Pushes a `new_message` frame to the other party of the session.
    ///
    /// Messages written by the user go to every admin socket; messages
    /// written by an admin go to the sockets of the session's user.
    pub async fn notify_counterpart(&self, author: Role, appended: &Appended) {
        let frame = InboundFrame::NewMessage(NewMessageFrame {
            session_id: appended.session_id.clone(),
            message: appended.message.clone(),
        });
        let Some(text) = encode(&frame) else { return };

        let conns = self.connections.read().await;
        let mut delivered = 0usize;
        for conn in conns.values() {
            let Some(principal) = &conn.principal else {
                continue;
            };
            let is_target = match author {
                Role::User => principal.role == Role::Admin,
                Role::Admin => principal.role == Role::User && principal.user_id == appended.user,
            };
            if is_target && conn.sender.send(Message::Text(text.clone().into())).is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!(
            session_id = %appended.session_id,
            message_id = %appended.message.id,
            delivered,
            "pushed new_message"
        );
    }

    /// Sends a close frame with [`RESTART_CLOSE_CODE`] to every socket.
    ///
    /// Each writer task stops after forwarding the close frame, so clients
    /// observe an abnormal closure. Useful for testing reconnection.
    pub async fn close_all_connections(&self) {
        let conns = self.connections.read().await;
        for (conn_id, conn) in conns.iter() {
            tracing::info!(conn_id, "sending close frame");
            let _ = conn.sender.send(Message::Close(Some(CloseFrame {
                code: RESTART_CLOSE_CODE,
                reason: "server restarting".into(),
            })));
        }
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Register the socket (unauthenticated).
/// 2. Process frames until the socket closes: `auth` binds the socket to
///    an account, `send_message` persists and fans out.
/// 3. On disconnect, unregister the socket.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.register(tx).await;
    tracing::info!(conn_id, "socket connected");

    // Writer task: forwards queued frames, stops after a close frame.
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(conn_id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    handle_text_message(conn_id, text.as_str(), &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::info!(conn_id, "received close frame");
                    break;
                }
                _ => {
                    // Ignore binary, ping, pong frames.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(conn_id).await;
    tracing::info!(conn_id, "socket disconnected and unregistered");
}

/// Handles one text frame from a socket.
async fn handle_text_message(conn_id: u64, text: &str, state: &Arc<ServerState>) {
    let frame = match frame::decode_outbound(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(conn_id, error = %e, "failed to decode frame");
            let reply = InboundFrame::MessageError(MessageErrorFrame {
                error: Some(e.to_string()),
                ..MessageErrorFrame::default()
            });
            state.send_to(conn_id, &reply).await;
            return;
        }
    };

    match frame {
        OutboundFrame::Auth(auth) => handle_auth(conn_id, auth, state).await,
        OutboundFrame::SendMessage(send) => handle_send(conn_id, send, state).await,
    }
}

async fn handle_auth(conn_id: u64, auth: AuthFrame, state: &Arc<ServerState>) {
    let principal = Principal::from_token(&auth.token).filter(|p| p.user_id == auth.user_id);
    let Some(principal) = principal else {
        tracing::warn!(conn_id, user_id = %auth.user_id, "auth rejected");
        let reply = InboundFrame::custom(
            "auth_error",
            serde_json::json!({ "error": "invalid credentials" }),
        );
        state.send_to(conn_id, &reply).await;
        return;
    };

    tracing::info!(conn_id, user_id = %principal.user_id, role = ?principal.role, "socket authenticated");
    let reply = InboundFrame::custom(
        "auth_success",
        serde_json::json!({
            "userId": principal.user_id,
            "role": principal.role.sender_role(),
        }),
    );
    state.authenticate(conn_id, principal).await;
    state.send_to(conn_id, &reply).await;
}

async fn handle_send(conn_id: u64, send: SendMessageFrame, state: &Arc<ServerState>) {
    let Some(principal) = state.principal_of(conn_id).await else {
        let reply = InboundFrame::MessageError(MessageErrorFrame {
            session_id: Some(send.session_id),
            temp_id: send.temp_id,
            error: Some("not authenticated".to_string()),
        });
        state.send_to(conn_id, &reply).await;
        return;
    };

    // The author role comes from the authenticated principal, not the frame.
    let appended = match state
        .store
        .append(
            &principal,
            &send.session_id,
            &send.content,
            send.temp_id.as_ref(),
        )
        .await
    {
        Ok(a) => a,
        Err(e) => {
            tracing::warn!(conn_id, session_id = %send.session_id, error = %e, "send rejected");
            let reply = InboundFrame::MessageError(MessageErrorFrame {
                session_id: Some(send.session_id),
                temp_id: send.temp_id,
                error: Some(e.to_string()),
            });
            state.send_to(conn_id, &reply).await;
            return;
        }
    };

    let ack = InboundFrame::MessageSent(MessageSentFrame {
        session_id: appended.session_id.clone(),
        message_id: appended.message.id.clone(),
        temp_id: send.temp_id,
    });
    state.send_to(conn_id, &ack).await;

    if !appended.duplicate {
        state.notify_counterpart(principal.role, &appended).await;
    }
}

fn encode(frame: &InboundFrame) -> Option<String> {
    match frame::encode_inbound(frame) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode frame");
            None
        }
    }
}

/// Axum handler upgrading `GET {ws_path}` to a WebSocket.
pub async fn ws_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<Arc<ServerState>>,
) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}
