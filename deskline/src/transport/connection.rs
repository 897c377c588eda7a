//! The process-wide WebSocket channel.
//!
//! [`ConnectionManager`] owns at most one live socket. It authenticates the
//! socket on open, flushes the [`MessageQueue`], and feeds every inbound
//! text frame to the [`DeliveryRouter`]. When the server closes the socket
//! with anything but a normal closure, reconnection is scheduled with
//! exponential backoff until [`ReconnectPolicy::max_attempts`] is reached;
//! after that only an explicit [`ConnectionManager::connect`] retries.
//!
//! Channel state is published on a `watch` channel, see
//! [`ConnectionManager::subscribe_status`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use deskline_proto::frame::{self, AuthFrame, OutboundFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{
    ChannelState, ConnectionConfig, ConnectionStatus, Identity, ReconnectPolicy, Transport,
    TransportError,
};
use crate::queue::MessageQueue;
use crate::router::DeliveryRouter;

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Close code of a normal closure; the only code that does not trigger
/// automatic reconnection.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Code recorded when a close frame carries no status.
const NO_STATUS_CODE: u16 = 1005;

/// Code recorded when the stream ends without a close frame.
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Handle to the shared channel. Clones refer to the same socket.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: ConnectionConfig,
    queue: Arc<MessageQueue>,
    router: Arc<DeliveryRouter>,
    identity: parking_lot::Mutex<Option<Identity>>,
    /// Write half of the live socket.
    writer: Mutex<Option<WsSender>>,
    status: watch::Sender<ConnectionStatus>,
    /// Serializes handshakes so concurrent connects share one socket.
    /// Holds the error of the last finished handshake, if it failed.
    connect_lock: Mutex<Option<TransportError>>,
    /// Handshakes finished so far, successful or not.
    attempts_finished: AtomicU64,
    manual_close: AtomicBool,
    /// Incremented on every open and on disconnect; a reader whose epoch
    /// is stale must not touch the channel.
    epoch: AtomicU64,
    reconnect_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.config.ws_url)
            .field("status", &*self.shared.status.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a disconnected manager.
    ///
    /// Nothing is opened until [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        queue: Arc<MessageQueue>,
        router: Arc<DeliveryRouter>,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            shared: Arc::new(Shared {
                config,
                queue,
                router,
                identity: parking_lot::Mutex::new(None),
                writer: Mutex::new(None),
                status,
                connect_lock: Mutex::new(None),
                attempts_finished: AtomicU64::new(0),
                manual_close: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                reconnect_task: parking_lot::Mutex::new(None),
                reader_task: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Opens the channel, or returns immediately if it is already open.
    ///
    /// If a handshake is already in flight this waits for it instead of
    /// opening a second socket. A given `identity` replaces the stored one;
    /// the stored identity, if any, is authenticated right after the open.
    /// Clears a previous [`disconnect`](Self::disconnect), re-enabling
    /// automatic reconnection.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the handshake exceeds the connect timeout.
    /// - [`TransportError::WebSocket`] if the server cannot be reached or rejects the upgrade.
    pub async fn connect(&self, identity: Option<Identity>) -> Result<(), TransportError> {
        if let Some(identity) = identity {
            *self.shared.identity.lock() = Some(identity);
        }
        self.shared.manual_close.store(false, Ordering::SeqCst);
        self.shared.open().await
    }

    /// Stores the identity and authenticates the open channel with it.
    ///
    /// When the channel is not open the identity is used on the next open.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is open but the auth frame cannot be
    /// sent.
    pub async fn set_identity(&self, identity: Identity) -> Result<(), TransportError> {
        *self.shared.identity.lock() = Some(identity.clone());
        if self.state() == ChannelState::Open {
            self.shared.send_auth(&identity).await?;
        }
        Ok(())
    }

    /// Closes the channel with a normal closure and stops reconnecting.
    ///
    /// Cancels any pending reconnection timer. Queued messages are kept
    /// for the next [`connect`](Self::connect).
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        shared.manual_close.store(true, Ordering::SeqCst);
        shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = shared.reconnect_task.lock().take() {
            task.abort();
        }

        let writer = shared.writer.lock().await.take();
        if let Some(mut writer) = writer {
            shared.set_state(ChannelState::Closing);
            let close = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            }));
            if let Err(e) = writer.send(close).await {
                tracing::debug!(error = %e, "close frame not sent");
            }
            if let Err(e) = writer.close().await {
                tracing::debug!(error = %e, "socket close failed");
            }
        }
        if let Some(task) = shared.reader_task.lock().take() {
            task.abort();
        }

        shared.status.send_modify(|s| {
            s.state = ChannelState::Disconnected;
            s.retry_delay = None;
        });
        tracing::info!(url = %shared.config.ws_url, "channel disconnected");
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Subscribes to status changes.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Returns `true` after [`disconnect`](Self::disconnect) until the next
    /// [`connect`](Self::connect).
    #[must_use]
    pub fn is_manually_closed(&self) -> bool {
        self.shared.manual_close.load(Ordering::SeqCst)
    }

    /// Backoff policy in use.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.shared.config.reconnect
    }
}

impl Transport for ConnectionManager {
    fn state(&self) -> ChannelState {
        self.shared.status.borrow().state
    }

    async fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        self.shared.send_frame(frame).await
    }

    fn request_connect(&self) {
        if self.is_manually_closed() {
            tracing::debug!("connect requested after manual disconnect, ignoring");
            return;
        }
        if matches!(
            self.state(),
            ChannelState::Open | ChannelState::Connecting
        ) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = shared.open().await {
                tracing::warn!(error = %e, "requested connect failed");
            }
        });
    }
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        self.status.send_modify(|s| s.state = state);
    }

    /// Performs the handshake unless the channel is already open.
    ///
    /// A caller that queued behind a handshake which then failed gets that
    /// handshake's error instead of starting another one.
    async fn open(self: &Arc<Self>) -> Result<(), TransportError> {
        let seen = self.attempts_finished.load(Ordering::SeqCst);
        let mut last_failure = self.connect_lock.lock().await;
        if self.status.borrow().state == ChannelState::Open {
            return Ok(());
        }
        if self.attempts_finished.load(Ordering::SeqCst) != seen
            && let Some(e) = last_failure.as_ref()
        {
            tracing::debug!(error = %e, "sharing result of the handshake in flight");
            return Err(e.shared_copy());
        }

        let result = self.handshake().await;
        *last_failure = result.as_ref().err().map(TransportError::shared_copy);
        self.attempts_finished.fetch_add(1, Ordering::SeqCst);
        drop(last_failure);

        if result.is_ok() {
            self.flush_queue().await;
        }
        result
    }

    /// Opens the socket, installs it and authenticates. Callers hold
    /// `connect_lock`.
    async fn handshake(self: &Arc<Self>) -> Result<(), TransportError> {
        self.set_state(ChannelState::Connecting);
        let url = self.config.ws_url.as_str();
        let ws_stream =
            match tokio::time::timeout(self.config.connect_timeout, connect_async(url)).await {
                Err(_) => {
                    tracing::warn!(url, "WebSocket connect timed out");
                    self.set_state(ChannelState::Disconnected);
                    return Err(TransportError::Timeout);
                }
                Ok(Err(e)) => {
                    tracing::warn!(url, err = %e, "WebSocket connect failed");
                    self.set_state(ChannelState::Disconnected);
                    return Err(map_ws_connect_error(e));
                }
                Ok(Ok((ws_stream, _response))) => ws_stream,
            };

        let (mut writer, reader) = ws_stream.split();
        {
            // disconnect() sets the flag before it takes the writer lock, so
            // checking under the lock leaves no window for a stray socket.
            let mut slot = self.writer.lock().await;
            if self.manual_close.load(Ordering::SeqCst) {
                drop(slot);
                tracing::debug!(url, "disconnected during handshake, dropping socket");
                if let Err(e) = writer.close().await {
                    tracing::debug!(error = %e, "socket close failed");
                }
                self.set_state(ChannelState::Disconnected);
                return Err(TransportError::ConnectionClosed);
            }

            *slot = Some(writer);
            let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            self.status.send_modify(|s| {
                *s = ConnectionStatus {
                    state: ChannelState::Open,
                    ..ConnectionStatus::default()
                };
            });
            tracing::info!(url, epoch, "channel open");

            let shared = Arc::clone(self);
            let handle = tokio::spawn(async move { shared.reader_loop(reader, epoch).await });
            if let Some(old) = self.reader_task.lock().replace(handle) {
                old.abort();
            }
        }

        let identity = self.identity.lock().clone();
        if let Some(identity) = identity
            && let Err(e) = self.send_auth(&identity).await
        {
            tracing::warn!(error = %e, "failed to send auth frame");
        }
        if self.manual_close.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    async fn send_auth(&self, identity: &Identity) -> Result<(), TransportError> {
        let frame = OutboundFrame::Auth(AuthFrame {
            user_id: identity.user_id.clone(),
            token: identity.token.clone(),
        });
        self.send_frame(&frame).await?;
        tracing::debug!(user_id = %identity.user_id, "auth frame sent");
        Ok(())
    }

    async fn send_frame(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let text = frame::encode_outbound(frame)?;
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        sink.send(Message::text(text)).await.map_err(|e| {
            tracing::warn!(err = %e, "WebSocket send failed");
            TransportError::WebSocket(e.to_string())
        })
    }

    async fn flush_queue(self: &Arc<Self>) {
        if self.queue.is_empty() {
            return;
        }
        let report = self
            .queue
            .flush(|message| {
                let frame = message.to_frame();
                let shared = Arc::clone(self);
                async move { shared.send_frame(&frame).await }
            })
            .await;
        tracing::debug!(?report, "queue flushed after open");
    }

    /// Dispatches inbound frames until the socket closes.
    async fn reader_loop(self: Arc<Self>, mut reader: WsReader, epoch: u64) {
        let mut close_code = None;
        while let Some(msg_result) = reader.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    // Malformed frames are logged and skipped by the router.
                    self.router.dispatch(text.as_str());
                }
                Ok(Message::Close(frame)) => {
                    let code = frame.map_or(NO_STATUS_CODE, |f| u16::from(f.code));
                    tracing::info!(code, "WebSocket closed by server");
                    close_code = Some(code);
                    break;
                }
                Ok(Message::Binary(_) | Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                    // Ignore non-text frames.
                }
                Err(e) => {
                    tracing::warn!(err = %e, "WebSocket read error");
                    break;
                }
            }
        }
        self.handle_closed(epoch, close_code.unwrap_or(ABNORMAL_CLOSE_CODE))
            .await;
    }

    async fn handle_closed(self: &Arc<Self>, epoch: u64, code: u16) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!(epoch, "stale reader exited");
            return;
        }
        self.writer.lock().await.take();
        self.set_state(ChannelState::Disconnected);

        if self.manual_close.load(Ordering::SeqCst) || code == NORMAL_CLOSE_CODE {
            tracing::info!(code, "channel closed normally");
            return;
        }
        tracing::warn!(code, "channel closed abnormally");
        self.schedule_reconnect();
    }

    /// Schedules the next automatic attempt, or marks reconnection as
    /// exhausted once the policy runs out.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.manual_close.load(Ordering::SeqCst) {
            return;
        }
        let attempt = self.status.borrow().attempts + 1;
        let Some(delay) = self.config.reconnect.delay_for(attempt) else {
            tracing::warn!(
                attempts = attempt - 1,
                "reconnect attempts exhausted, waiting for an explicit connect"
            );
            self.status.send_modify(|s| {
                s.state = ChannelState::Disconnected;
                s.exhausted = true;
                s.retry_delay = None;
            });
            return;
        };

        self.status.send_modify(|s| {
            s.attempts = attempt;
            s.retry_delay = Some(delay);
        });
        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );

        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if shared.manual_close.load(Ordering::SeqCst) {
                return;
            }
            shared.status.send_modify(|s| s.retry_delay = None);
            if let Err(e) = shared.open().await {
                tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                shared.schedule_reconnect();
            }
        });
        // The previous handle belongs to the task that just failed, if any.
        drop(self.reconnect_task.lock().replace(handle));
    }
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
        WsError::Http(response) => {
            TransportError::WebSocket(format!("HTTP error: status {}", response.status()))
        }
        other => TransportError::WebSocket(other.to_string()),
    }
}
