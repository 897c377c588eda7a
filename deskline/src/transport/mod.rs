//! Duplex channel to the messaging server.
//!
//! Defines the [`Transport`] trait the session controllers send through.
//! Concrete implementations:
//! - [`connection::ConnectionManager`]: the process-wide WebSocket channel
//!   with reconnection and backoff
//! - [`loopback::LoopbackTransport`]: in-process recording transport for testing

pub mod connection;
pub mod loopback;

use std::fmt;
use std::time::Duration;

use deskline_proto::frame::{FrameError, OutboundFrame};
use deskline_proto::message::UserId;

/// Lifecycle state of the duplex channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// No channel; sends fail until a connect succeeds.
    #[default]
    Disconnected,
    /// A handshake is in flight.
    Connecting,
    /// The channel is usable.
    Open,
    /// A client-initiated close is in progress.
    Closing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
        }
    }
}

/// Snapshot of the channel published to status observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    /// Current channel state.
    pub state: ChannelState,
    /// Automatic reconnection attempts since the last successful open.
    pub attempts: u32,
    /// `true` once automatic reconnection has given up.
    pub exhausted: bool,
    /// Delay before the pending reconnection attempt, if one is scheduled.
    pub retry_delay: Option<Duration>,
}

/// Account the channel authenticates as.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    /// Account ID.
    pub user_id: UserId,
    /// Bearer token.
    pub token: String,
}

impl Identity {
    /// Creates an identity.
    pub fn new(user_id: UserId, token: impl Into<String>) -> Self {
        Self {
            user_id,
            token: token.into(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Exponential backoff for automatic reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Number of automatic attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt.
    ///
    /// Returns `base_delay * 2^(attempt - 1)` capped at `max_delay`, or
    /// `None` when `attempt` is 0 or exceeds `max_attempts`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

/// Settings for the [`connection::ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL (`ws://` or `wss://`).
    pub ws_url: String,
    /// Bound on the opening handshake.
    pub connect_timeout: Duration,
    /// Automatic reconnection policy.
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    /// Creates a config for `ws_url` with default timeout and backoff.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel closed while the operation was in progress.
    #[error("connection closed")]
    ConnectionClosed,

    /// The opening handshake did not complete in time.
    #[error("transport operation timed out")]
    Timeout,

    /// The channel is not open.
    #[error("not connected")]
    NotConnected,

    /// The server address could not be turned into a WebSocket URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// A frame could not be encoded.
    #[error(transparent)]
    Codec(#[from] FrameError),

    /// The WebSocket layer reported an error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl TransportError {
    /// Copy handed to callers that waited on another caller's handshake.
    ///
    /// Codec errors carry a non-cloneable source and are flattened to
    /// their message.
    pub(crate) fn shared_copy(&self) -> Self {
        match self {
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::Timeout => Self::Timeout,
            Self::NotConnected => Self::NotConnected,
            Self::InvalidUrl(url) => Self::InvalidUrl(url.clone()),
            Self::Codec(e) => Self::WebSocket(e.to_string()),
            Self::WebSocket(msg) => Self::WebSocket(msg.clone()),
        }
    }
}

/// Channel the session controllers deliver frames through.
///
/// Implementations hand frames to the server without waiting for an
/// application-level acknowledgment; acks arrive as inbound frames.
pub trait Transport: Send + Sync {
    /// Current channel state.
    fn state(&self) -> ChannelState;

    /// Sends one frame over the channel.
    ///
    /// Returns `Ok(())` once the frame has been handed to the socket. This
    /// does NOT guarantee delivery.
    fn send(
        &self,
        frame: &OutboundFrame,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Asks the transport to (re)establish the channel in the background.
    fn request_connect(&self);
}

/// Derives the WebSocket URL from an HTTP(S) base URL.
///
/// `http` becomes `ws` and `https` becomes `wss`; `ws`/`wss` URLs pass
/// through. The path is replaced by `suffix` and any query or fragment is
/// dropped.
///
/// # Errors
///
/// Returns [`TransportError::InvalidUrl`] if `base` does not parse or uses
/// another scheme.
pub fn ws_url_from_base(base: &str, suffix: &str) -> Result<String, TransportError> {
    let mut url = url::Url::parse(base)
        .map_err(|e| TransportError::InvalidUrl(format!("{base}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "{base}: unsupported scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidUrl(format!("{base}: cannot use scheme {scheme}")))?;
    url.set_path(suffix);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}
