//! Per-surface chat session state.
//!
//! A [`ChatSessionController`] owns the view of one UI surface (the end
//! user's chat widget or the admin console): the open session with its
//! message sequence, the session list, and unread state. It sends through a
//! shared [`Transport`] and [`MessageQueue`], persists through a
//! [`SessionApi`], and learns about server-side changes from frames the
//! [`DeliveryRouter`] hands it after [`attach`](ChatSessionController::attach).
//!
//! State changes are reported on an `mpsc` channel of [`SessionEvent`]s.
//!
//! The send path lives in [`send`] and inbound frame handling in
//! [`receive`].

pub mod receive;
pub mod send;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use deskline_proto::frame::{EventType, InboundFrame};
use deskline_proto::message::{
    ChatSession, Message, MessageId, SenderRole, SessionId, SessionStatus, SessionSummary,
    UserId, ValidationError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::api::{ApiError, SessionApi};
use crate::queue::MessageQueue;
use crate::router::{DeliveryRouter, Subscription};
use crate::transport::Transport;

/// Which side of the conversation a controller represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    /// The end user's chat widget.
    User,
    /// The support-desk console.
    Admin,
}

impl Surface {
    /// Role recorded on messages sent from this surface.
    #[must_use]
    pub const fn sender_role(self) -> SenderRole {
        match self {
            Self::User => SenderRole::User,
            Self::Admin => SenderRole::Admin,
        }
    }

    /// Returns `true` if a message from `sender` counts as unread here.
    #[must_use]
    pub fn is_counterpart(self, sender: SenderRole) -> bool {
        sender != self.sender_role()
    }
}

impl std::fmt::Display for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Admin => f.write_str("admin"),
        }
    }
}

/// How [`ChatSessionController::send_message`] uses the two delivery paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Also persist over REST when the channel accepted the frame.
    ///
    /// Doubles the requests per message; the server collapses the copies
    /// by temporary ID.
    pub dual_send: bool,
    /// Buffer the message in the queue when the channel is not open, so it
    /// is replayed on reconnect in addition to the REST call.
    pub queue_when_offline: bool,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            dual_send: true,
            queue_when_offline: false,
        }
    }
}

/// Load state of the controller's open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No session is open.
    #[default]
    NoSession,
    /// A session is being fetched.
    Loading,
    /// The open session is loaded.
    Ready,
}

/// State changes reported to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session finished loading and is now open.
    SessionLoaded {
        /// The opened session.
        session_id: SessionId,
    },
    /// A message was appended to the open session.
    MessageAppended {
        /// The open session.
        session_id: SessionId,
        /// The appended message.
        message: Message,
    },
    /// A temporary ID was replaced by the server-assigned one.
    MessageReconciled {
        /// Session holding the message.
        session_id: SessionId,
        /// The replaced temporary ID.
        temp_id: MessageId,
        /// The permanent ID.
        message_id: MessageId,
    },
    /// An optimistic message was removed after its delivery failed.
    MessageRolledBack {
        /// Session the message was sent to.
        session_id: SessionId,
        /// Temporary ID of the removed message.
        temp_id: MessageId,
        /// Text to hand back to the input field.
        content: String,
    },
    /// The unread count of a session changed.
    UnreadChanged {
        /// Session whose count changed.
        session_id: SessionId,
        /// New count.
        unread_count: u32,
    },
    /// The open session received an unread counterpart message.
    ReadReceiptDue {
        /// The open session.
        session_id: SessionId,
    },
    /// The server rejected a message sent over the channel.
    DeliveryError {
        /// Session named by the server, if any.
        session_id: Option<SessionId>,
        /// Temporary ID of the rejected message, if known.
        temp_id: Option<MessageId>,
        /// Server-provided reason.
        error: String,
    },
}

/// Errors from session lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The REST call failed.
    #[error("session API error: {0}")]
    Api(#[from] ApiError),

    /// A newer load or a close replaced this load before it finished.
    #[error("load of session {0} was superseded")]
    Superseded(SessionId),

    /// The operation needs an open session.
    #[error("no session is open")]
    NoOpenSession,
}

/// Why a send failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The content was rejected before anything was sent.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The REST fallback failed and the channel did not take the message.
    #[error("delivery failed: {0}")]
    Api(#[from] ApiError),
}

/// A failed send, carrying the content back for a retry.
#[derive(Debug, thiserror::Error)]
#[error("failed to send message: {source}")]
pub struct SendFailure {
    /// The text the caller tried to send.
    pub content: String,
    /// The underlying failure.
    pub source: SendError,
}

impl SendFailure {
    fn new(content: &str, source: impl Into<SendError>) -> Self {
        Self {
            content: content.to_string(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    phase: SessionPhase,
    open: Option<ChatSession>,
    loading: Option<SessionId>,
    load_generation: u64,
    summaries: Vec<SessionSummary>,
    read_receipt_due: bool,
}

impl ControllerState {
    fn open_mut(&mut self, id: &SessionId) -> Option<&mut ChatSession> {
        self.open.as_mut().filter(|s| s.id == *id)
    }

    fn is_open(&self, id: &SessionId) -> bool {
        self.open.as_ref().is_some_and(|s| s.id == *id)
    }

    fn summary_mut(&mut self, id: &SessionId) -> Option<&mut SessionSummary> {
        self.summaries.iter_mut().find(|s| s.id == *id)
    }

    /// Returns the summary for `id`, inserting a placeholder if unknown.
    fn summary_entry(&mut self, id: &SessionId) -> &mut SessionSummary {
        let index = match self.summaries.iter().position(|s| s.id == *id) {
            Some(index) => index,
            None => {
                self.summaries.push(SessionSummary {
                    id: id.clone(),
                    user: UserId::default(),
                    admin: None,
                    status: SessionStatus::default(),
                    unread_count: 0,
                    last_message: None,
                });
                self.summaries.len() - 1
            }
        };
        &mut self.summaries[index]
    }

    /// Copies the open session's view into its summary.
    fn sync_summary(&mut self, id: &SessionId) {
        let Some(open) = self.open.as_ref().filter(|s| s.id == *id) else {
            return;
        };
        let fresh = open.summary();
        match self.summary_mut(id) {
            Some(summary) => {
                summary.last_message = fresh.last_message;
                summary.unread_count = fresh.unread_count;
                summary.status = fresh.status;
                summary.admin = fresh.admin;
                summary.user = fresh.user;
            }
            None => self.summaries.push(fresh),
        }
    }

    /// Who a message from `surface` in session `id` is addressed to.
    fn receiver_for(&self, surface: Surface, id: &SessionId) -> Option<UserId> {
        let (user, admin) = match self.open.as_ref().filter(|s| s.id == *id) {
            Some(open) => (Some(&open.user), open.admin.as_ref()),
            None => {
                let summary = self.summaries.iter().find(|s| s.id == *id)?;
                (Some(&summary.user), summary.admin.as_ref())
            }
        };
        match surface {
            Surface::User => admin.cloned(),
            Surface::Admin => user.filter(|u| !u.as_str().is_empty()).cloned(),
        }
    }
}

/// Chat state of one UI surface.
pub struct ChatSessionController<T: Transport, A: SessionApi> {
    surface: Surface,
    transport: T,
    api: A,
    queue: Arc<MessageQueue>,
    policy: DeliveryPolicy,
    state: Mutex<ControllerState>,
    event_tx: mpsc::Sender<SessionEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl<T: Transport, A: SessionApi> std::fmt::Debug for ChatSessionController<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChatSessionController")
            .field("surface", &self.surface)
            .field("phase", &state.phase)
            .field("open", &state.open.as_ref().map(|s| &s.id))
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<T: Transport, A: SessionApi> ChatSessionController<T, A> {
    /// Creates a controller with no open session.
    ///
    /// Returns the controller and the receiving end of its event channel,
    /// which holds up to `event_buffer` undelivered events; further events
    /// are dropped until the UI catches up.
    pub fn new(
        surface: Surface,
        transport: T,
        api: A,
        queue: Arc<MessageQueue>,
        policy: DeliveryPolicy,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(event_buffer.max(1));
        let controller = Self {
            surface,
            transport,
            api,
            queue,
            policy,
            state: Mutex::new(ControllerState::default()),
            event_tx,
            subscriptions: Mutex::new(Vec::new()),
        };
        (controller, event_rx)
    }

    /// Surface this controller represents.
    pub const fn surface(&self) -> Surface {
        self.surface
    }

    /// Delivery policy in effect.
    pub const fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    /// Transport the controller sends through.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// REST client the controller persists through.
    pub const fn api(&self) -> &A {
        &self.api
    }

    /// Shared outbound queue.
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Current load state.
    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    /// ID of the open session, if any.
    pub fn open_session_id(&self) -> Option<SessionId> {
        self.state.lock().open.as_ref().map(|s| s.id.clone())
    }

    /// Copy of the open session.
    pub fn session(&self) -> Option<ChatSession> {
        self.state.lock().open.clone()
    }

    /// Messages of the open session, in order.
    pub fn messages(&self) -> Vec<Message> {
        self.state
            .lock()
            .open
            .as_ref()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    /// Copy of the session list.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.state.lock().summaries.clone()
    }

    /// Unread count of session `id` as known locally.
    pub fn unread_count(&self, id: &SessionId) -> Option<u32> {
        let state = self.state.lock();
        if let Some(open) = state.open.as_ref().filter(|s| s.id == *id) {
            return Some(open.unread_count);
        }
        state
            .summaries
            .iter()
            .find(|s| s.id == *id)
            .map(|s| s.unread_count)
    }

    /// Returns `true` if the open session has unread counterpart messages
    /// that have not been reported with [`mark_read`](Self::mark_read).
    pub fn read_receipt_due(&self) -> bool {
        self.state.lock().read_receipt_due
    }

    /// Loads session `id` and makes it the open session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Superseded`] if another
    /// [`open_session`](Self::open_session) or a
    /// [`close_session`](Self::close_session) ran while this load was in
    /// flight; its result is discarded. Returns [`SessionError::Api`] if
    /// the fetch fails, leaving any previously open session in place.
    pub async fn open_session(&self, id: &SessionId) -> Result<(), SessionError> {
        let generation = {
            let mut state = self.state.lock();
            state.load_generation += 1;
            state.phase = SessionPhase::Loading;
            state.loading = Some(id.clone());
            state.load_generation
        };
        tracing::debug!(surface = %self.surface, session_id = %id, "loading session");

        let result = self.api.get_session(id).await;

        let mut state = self.state.lock();
        if state.load_generation != generation {
            tracing::debug!(session_id = %id, "discarding superseded session load");
            return Err(SessionError::Superseded(id.clone()));
        }
        state.loading = None;

        match result {
            Ok(mut session) => {
                let session_id = session.id.clone();
                if let Some(previous) = state.open.as_ref()
                    && previous.id == session_id
                {
                    merge_reloaded(previous, &mut session, self.surface);
                }
                state.read_receipt_due = session
                    .messages
                    .iter()
                    .any(|m| self.surface.is_counterpart(m.sender) && !m.read);
                state.open = Some(session);
                state.phase = SessionPhase::Ready;
                state.sync_summary(&session_id);
                drop(state);
                tracing::info!(surface = %self.surface, session_id = %session_id, "session loaded");
                self.emit(SessionEvent::SessionLoaded { session_id });
                Ok(())
            }
            Err(e) => {
                state.phase = if state.open.is_some() {
                    SessionPhase::Ready
                } else {
                    SessionPhase::NoSession
                };
                drop(state);
                tracing::warn!(session_id = %id, error = %e, "session load failed");
                Err(e.into())
            }
        }
    }

    /// Re-fetches the open session (or the one being loaded).
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoOpenSession`] if there is nothing to
    /// reload, otherwise as [`open_session`](Self::open_session).
    pub async fn reload(&self) -> Result<(), SessionError> {
        let id = {
            let state = self.state.lock();
            state
                .loading
                .clone()
                .or_else(|| state.open.as_ref().map(|s| s.id.clone()))
        };
        let id = id.ok_or(SessionError::NoOpenSession)?;
        self.open_session(&id).await
    }

    /// Replaces the session list with the server's.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Api`] if the fetch fails; the local list is
    /// left unchanged.
    pub async fn refresh_sessions(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let summaries = self.api.list_sessions().await?;
        let mut state = self.state.lock();
        state.summaries.clone_from(&summaries);
        if let Some(id) = state.open.as_ref().map(|s| s.id.clone()) {
            state.sync_summary(&id);
        }
        tracing::debug!(surface = %self.surface, count = summaries.len(), "session list refreshed");
        Ok(summaries)
    }

    /// Closes the open session and cancels any load in flight.
    pub fn close_session(&self) {
        let mut state = self.state.lock();
        state.load_generation += 1;
        state.phase = SessionPhase::NoSession;
        state.loading = None;
        state.read_receipt_due = false;
        if let Some(session) = state.open.take() {
            tracing::debug!(surface = %self.surface, session_id = %session.id, "session closed");
        }
    }

    /// Reports the open session as read, then marks the counterpart's
    /// messages read locally.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoOpenSession`] without a session, or
    /// [`SessionError::Api`] if the server call fails (local state is then
    /// unchanged).
    pub async fn mark_read(&self) -> Result<(), SessionError> {
        let id = self.open_session_id().ok_or(SessionError::NoOpenSession)?;
        self.api.mark_read(&id).await?;

        let mut state = self.state.lock();
        let surface = self.surface;
        if let Some(open) = state.open_mut(&id) {
            for message in open
                .messages
                .iter_mut()
                .filter(|m| surface.is_counterpart(m.sender))
            {
                message.mark_read();
            }
            open.unread_count = 0;
        }
        state.read_receipt_due = false;
        if let Some(summary) = state.summary_mut(&id) {
            summary.unread_count = 0;
        }
        drop(state);
        self.emit(SessionEvent::UnreadChanged {
            session_id: id,
            unread_count: 0,
        });
        Ok(())
    }

    /// Detaches from `router`, removing exactly the handlers registered by
    /// [`attach`](Self::attach).
    ///
    /// Returns the number of handlers removed.
    pub fn detach(&self, router: &DeliveryRouter) -> usize {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        subscriptions
            .iter()
            .filter(|sub| router.unsubscribe(sub))
            .count()
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            tracing::trace!(surface = %self.surface, error = %e, "session event dropped");
        }
    }

    fn emit_all(&self, events: Vec<SessionEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}

impl<T, A> ChatSessionController<T, A>
where
    T: Transport + 'static,
    A: SessionApi + 'static,
{
    /// Registers handlers for `new_message`, `message_sent` and
    /// `message_error` on `router`.
    ///
    /// The handlers hold a weak reference and do nothing once the
    /// controller is dropped. Returns the new subscriptions; they are also
    /// kept for [`detach`](Self::detach).
    pub fn attach(self: &Arc<Self>, router: &DeliveryRouter) -> Vec<Subscription> {
        let weak = Arc::downgrade(self);
        let on_new = router.on(EventType::NewMessage, move |frame| {
            if let (Some(controller), InboundFrame::NewMessage(frame)) = (weak.upgrade(), frame) {
                controller.handle_new_message(frame);
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        let on_sent = router.on(EventType::MessageSent, move |frame| {
            if let (Some(controller), InboundFrame::MessageSent(frame)) = (weak.upgrade(), frame) {
                controller.handle_message_sent(frame);
            }
            Ok(())
        });

        let weak = Arc::downgrade(self);
        let on_error = router.on(EventType::MessageError, move |frame| {
            if let (Some(controller), InboundFrame::MessageError(frame)) = (weak.upgrade(), frame)
            {
                controller.handle_message_error(frame);
            }
            Ok(())
        });

        let subscriptions = vec![on_new, on_sent, on_error];
        self.subscriptions
            .lock()
            .extend(subscriptions.iter().cloned());
        tracing::debug!(surface = %self.surface, "controller attached to router");
        subscriptions
    }
}

/// Carries local knowledge of the open session into a fresh server copy.
///
/// Read flags only move forward, and optimistic messages the server copy
/// does not show yet are kept at the end so their ack can still find them.
/// A temporary message is considered shown when an unclaimed server
/// message has the same sender and content.
fn merge_reloaded(previous: &ChatSession, fresh: &mut ChatSession, surface: Surface) {
    for message in &mut fresh.messages {
        if let Some(local) = previous.messages.iter().find(|m| m.id == message.id) {
            message.merge_read(local.read);
        }
    }

    let mut claimed = vec![false; fresh.messages.len()];
    let mut pending = Vec::new();
    for local in previous.messages.iter().filter(|m| m.id.is_temporary()) {
        if fresh.messages.iter().any(|m| m.id == local.id) {
            continue;
        }
        let shown = (0..fresh.messages.len()).find(|&i| {
            let m = &fresh.messages[i];
            !claimed[i] && !m.id.is_temporary() && m.sender == local.sender && m.content == local.content
        });
        match shown {
            Some(i) => claimed[i] = true,
            None => pending.push(local.clone()),
        }
    }
    if !pending.is_empty() {
        tracing::debug!(session_id = %fresh.id, kept = pending.len(), "keeping unacknowledged messages across reload");
        fresh.messages.extend(pending);
    }

    let unread = fresh
        .messages
        .iter()
        .filter(|m| surface.is_counterpart(m.sender) && !m.read)
        .count();
    if unread == 0 {
        fresh.unread_count = 0;
    }
}
