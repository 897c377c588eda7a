//! In-memory [`SessionApi`] and controller fixtures for unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use deskline_proto::message::{
    ChatSession, Message, MessageId, SenderRole, SessionId, SessionSummary, UserId,
};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

use super::{ChatSessionController, DeliveryPolicy, SessionEvent, Surface};
use crate::api::{ApiError, SessionApi};
use crate::queue::MessageQueue;
use crate::transport::ChannelState;
use crate::transport::loopback::LoopbackTransport;

#[derive(Default)]
pub struct FakeApi {
    sessions: Mutex<BTreeMap<SessionId, ChatSession>>,
    posted: Mutex<Vec<(SessionId, String, Option<MessageId>)>>,
    held: Mutex<BTreeMap<SessionId, Arc<Notify>>>,
    fail_posts: AtomicBool,
    mark_read_calls: AtomicUsize,
}

impl FakeApi {
    pub fn insert(&self, session: ChatSession) {
        self.sessions.lock().insert(session.id.clone(), session);
    }

    /// Makes `get_session(id)` wait until `gate` is notified.
    pub fn hold(&self, id: &SessionId, gate: Arc<Notify>) {
        self.held.lock().insert(id.clone(), gate);
    }

    pub fn fail_posts(&self, fail: bool) {
        self.fail_posts.store(fail, Ordering::SeqCst);
    }

    pub fn posted(&self) -> Vec<(SessionId, String, Option<MessageId>)> {
        self.posted.lock().clone()
    }

    pub fn mark_read_calls(&self) -> usize {
        self.mark_read_calls.load(Ordering::SeqCst)
    }

    fn not_found() -> ApiError {
        ApiError::Status {
            status: 404,
            body: r#"{"error":"session not found"}"#.into(),
        }
    }
}

impl SessionApi for FakeApi {
    async fn send_message(
        &self,
        session_id: &SessionId,
        content: &str,
        temp_id: Option<&MessageId>,
    ) -> Result<Message, ApiError> {
        if self.fail_posts.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                body: String::new(),
            });
        }
        self.posted
            .lock()
            .push((session_id.clone(), content.to_string(), temp_id.cloned()));
        let n = self.posted.lock().len();
        Ok(Message::new(
            MessageId::new(format!("srv_{n}")),
            SenderRole::User,
            content,
        ))
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<ChatSession, ApiError> {
        let gate = self.held.lock().get(session_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(Self::not_found)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError> {
        Ok(self.sessions.lock().values().map(ChatSession::summary).collect())
    }

    async fn mark_read(&self, session_id: &SessionId) -> Result<(), ApiError> {
        if !self.sessions.lock().contains_key(session_id) {
            return Err(Self::not_found());
        }
        self.mark_read_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A session owned by `u1` whose messages use their ID as content.
pub fn session_with(id: &str, messages: &[(&str, SenderRole)]) -> ChatSession {
    let mut session = ChatSession::new(SessionId::new(id), UserId::new("u1"));
    session.messages = messages
        .iter()
        .map(|(mid, sender)| Message::new(MessageId::new(*mid), *sender, *mid))
        .collect();
    session
}

pub fn controller(
    surface: Surface,
    state: ChannelState,
    api: FakeApi,
) -> (
    ChatSessionController<LoopbackTransport, FakeApi>,
    LoopbackTransport,
    mpsc::Receiver<SessionEvent>,
) {
    controller_with_policy(surface, state, api, DeliveryPolicy::default())
}

pub fn controller_with_policy(
    surface: Surface,
    state: ChannelState,
    api: FakeApi,
    policy: DeliveryPolicy,
) -> (
    ChatSessionController<LoopbackTransport, FakeApi>,
    LoopbackTransport,
    mpsc::Receiver<SessionEvent>,
) {
    let transport = LoopbackTransport::new(state);
    let (ctrl, events) = ChatSessionController::new(
        surface,
        transport.clone(),
        api,
        Arc::new(MessageQueue::new()),
        policy,
        64,
    );
    (ctrl, transport, events)
}
