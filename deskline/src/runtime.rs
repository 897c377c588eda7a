//! The process-wide chat service.
//!
//! [`ChatRuntime`] is constructed once at startup and shared by reference.
//! It owns the single [`ConnectionManager`], [`MessageQueue`],
//! [`DeliveryRouter`] and [`RestClient`], and hands out session controllers
//! wired to them. Any number of controllers (a user widget and an admin
//! console, or several admin views) can be attached at the same time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::{ApiError, RestClient};
use crate::queue::MessageQueue;
use crate::router::DeliveryRouter;
use crate::session::{ChatSessionController, DeliveryPolicy, SessionEvent, Surface};
use crate::transport::connection::ConnectionManager;
use crate::transport::{ChannelState, ConnectionConfig, Identity, Transport, TransportError};

/// Session controller bound to the live channel and REST client.
pub type SessionController = ChatSessionController<ConnectionManager, RestClient>;

/// Settings for a [`ChatRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// WebSocket channel settings.
    pub connection: ConnectionConfig,
    /// Base URL of the REST API, e.g. `http://localhost:5000/api`.
    pub api_base: String,
    /// Timeout for each REST request.
    pub request_timeout: Duration,
    /// Delivery policy for new controllers.
    pub policy: DeliveryPolicy,
    /// Event channel capacity of new controllers.
    pub event_buffer: usize,
    /// Period of the background health check; `None` disables it.
    pub health_check_interval: Option<Duration>,
}

impl RuntimeConfig {
    /// Creates a config with default timeouts and policy.
    pub fn new(api_base: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(ws_url),
            api_base: api_base.into(),
            request_timeout: Duration::from_secs(10),
            policy: DeliveryPolicy::default(),
            event_buffer: 64,
            health_check_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Shared channel, queue, router and REST client.
pub struct ChatRuntime {
    config: RuntimeConfig,
    connection: ConnectionManager,
    queue: Arc<MessageQueue>,
    router: Arc<DeliveryRouter>,
    api: RestClient,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChatRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRuntime")
            .field("connection", &self.connection)
            .field("api", &self.api)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl ChatRuntime {
    /// Builds the runtime. Nothing connects until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns an [`ApiError`] if the REST client cannot be built from
    /// `config.api_base`.
    pub fn new(config: RuntimeConfig) -> Result<Self, ApiError> {
        let api = RestClient::new(&config.api_base, None, config.request_timeout)?;
        let queue = Arc::new(MessageQueue::new());
        let router = Arc::new(DeliveryRouter::new());
        let connection =
            ConnectionManager::new(config.connection.clone(), Arc::clone(&queue), Arc::clone(&router));
        Ok(Self {
            config,
            connection,
            queue,
            router,
            api,
            health_task: Mutex::new(None),
        })
    }

    /// Authenticates both paths as `identity` and opens the channel.
    ///
    /// Starts the background health check when one is configured.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the first open fails. The REST path
    /// is usable regardless, and the health check keeps retrying the channel.
    pub async fn start(self: &Arc<Self>, identity: Identity) -> Result<(), TransportError> {
        self.api.set_token(Some(identity.token.clone()));
        if let Some(interval) = self.config.health_check_interval {
            self.spawn_health_check(interval);
        }
        self.connection.connect(Some(identity)).await
    }

    /// Switches both paths to a new identity, e.g. after a re-login.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is open and the auth frame cannot be
    /// sent.
    pub async fn login(&self, identity: Identity) -> Result<(), TransportError> {
        self.api.set_token(Some(identity.token.clone()));
        self.connection.set_identity(identity).await
    }

    /// Creates a controller for `surface` and attaches it to the router.
    pub fn controller(
        &self,
        surface: Surface,
    ) -> (Arc<SessionController>, mpsc::Receiver<SessionEvent>) {
        let (controller, events) = ChatSessionController::new(
            surface,
            self.connection.clone(),
            self.api.clone(),
            Arc::clone(&self.queue),
            self.config.policy,
            self.config.event_buffer,
        );
        let controller = Arc::new(controller);
        let _subscriptions = controller.attach(&self.router);
        (controller, events)
    }

    /// Shorthand for [`controller`](Self::controller) with [`Surface::User`].
    pub fn user_controller(&self) -> (Arc<SessionController>, mpsc::Receiver<SessionEvent>) {
        self.controller(Surface::User)
    }

    /// Shorthand for [`controller`](Self::controller) with [`Surface::Admin`].
    pub fn admin_controller(&self) -> (Arc<SessionController>, mpsc::Receiver<SessionEvent>) {
        self.controller(Surface::Admin)
    }

    /// Reopens the channel if it is down and was not closed on purpose.
    ///
    /// This is the external trigger that resumes after automatic
    /// reconnection gave up. Returns `true` if a connect was attempted and
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Returns the [`TransportError`] of a failed attempt.
    pub async fn health_check(&self) -> Result<bool, TransportError> {
        if self.connection.is_manually_closed() {
            return Ok(false);
        }
        if matches!(
            self.connection.state(),
            ChannelState::Open | ChannelState::Connecting
        ) {
            return Ok(false);
        }
        tracing::info!(
            attempts = self.connection.status().attempts,
            "health check reopening channel"
        );
        self.connection.connect(None).await?;
        Ok(true)
    }

    /// Runs [`health_check`](Self::health_check) every `interval`, replacing
    /// a previously spawned check. The task ends when the runtime is
    /// dropped.
    pub fn spawn_health_check(self: &Arc<Self>, interval: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(runtime) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = runtime.health_check().await {
                    tracing::warn!(error = %e, "health check connect failed");
                }
            }
        });
        if let Some(previous) = self.health_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stops the health check and closes the channel.
    ///
    /// Queued messages stay in the queue.
    pub async fn shutdown(&self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        self.connection.disconnect().await;
    }

    /// The shared channel.
    pub const fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// The shared outbound queue.
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// The shared inbound router.
    pub fn router(&self) -> &Arc<DeliveryRouter> {
        &self.router
    }

    /// The shared REST client.
    pub const fn api(&self) -> &RestClient {
        &self.api
    }
}

impl Drop for ChatRuntime {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.get_mut().take() {
            task.abort();
        }
    }
}
