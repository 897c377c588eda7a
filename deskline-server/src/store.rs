//! In-memory session store.
//!
//! Holds every chat session and its messages for the lifetime of the
//! process. Unread counts are not stored; they are derived per viewer from
//! the read flags of the counterpart's messages.
//!
//! Clients deliver each message over both the WebSocket and REST, tagging
//! both copies with the same temporary ID. [`SessionStore::append`] uses that
//! ID to persist the message once and return the stored copy to the second
//! request.

use std::collections::HashMap;

use deskline_proto::message::{
    ChatSession, Message, MessageId, SessionId, SessionStatus, SessionSummary, UserId,
    ValidationError,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::{Principal, Role};

/// Errors returned by [`SessionStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No session with that ID exists.
    #[error("session {0} not found")]
    NotFound(SessionId),
    /// The caller may not access that session.
    #[error("access to session {0} denied")]
    Forbidden(SessionId),
    /// The session is closed and accepts no more messages.
    #[error("session {0} is closed")]
    Closed(SessionId),
    /// The message content was rejected.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// A message that was just persisted, with the participants to notify.
#[derive(Debug, Clone)]
pub struct Appended {
    /// Session the message was stored in.
    pub session_id: SessionId,
    /// The persisted message.
    pub message: Message,
    /// Owner of the session.
    pub user: UserId,
    /// `true` if the message had already been stored under the same
    /// client temporary ID.
    pub duplicate: bool,
}

/// In-memory store of chat sessions keyed by session ID.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<SessionId, ChatSession>,
    /// Maps (session, client temporary ID) to the permanent ID.
    client_ids: HashMap<(SessionId, MessageId), MessageId>,
}

impl SessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new waiting session owned by `user`.
    pub async fn create_session(&self, user: UserId) -> ChatSession {
        let id = SessionId::new(Uuid::now_v7().simple().to_string());
        let session = ChatSession::new(id.clone(), user);
        self.inner.write().await.sessions.insert(id, session.clone());
        tracing::info!(session_id = %session.id, user = %session.user, "session created");
        session
    }

    /// Returns the session as seen by `viewer`, with its unread count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Forbidden`].
    pub async fn get(&self, viewer: &Principal, id: &SessionId) -> Result<ChatSession, StoreError> {
        let inner = self.inner.read().await;
        let session = inner
            .sessions
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        check_access(viewer, session)?;
        Ok(view_for(viewer, session))
    }

    /// Lists the sessions visible to `viewer`, newest activity first.
    pub async fn list(&self, viewer: &Principal) -> Vec<SessionSummary> {
        let inner = self.inner.read().await;
        let mut summaries: Vec<SessionSummary> = inner
            .sessions
            .values()
            .filter(|s| check_access(viewer, s).is_ok())
            .map(|s| view_for(viewer, s).summary())
            .collect();
        summaries.sort_by(|a, b| {
            let at = |s: &SessionSummary| s.last_message.as_ref().map(|m| m.created_at);
            at(b).cmp(&at(a)).then_with(|| a.id.cmp(&b.id))
        });
        summaries
    }

    /// Persists a message authored by `author`.
    ///
    /// The first admin to write into a waiting session is assigned to it and
    /// the session becomes active. When `client_id` was already seen for
    /// this session, nothing is stored and the earlier message is returned
    /// with `duplicate` set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the session is missing, inaccessible,
    /// closed, or the content is invalid.
    pub async fn append(
        &self,
        author: &Principal,
        id: &SessionId,
        content: &str,
        client_id: Option<&MessageId>,
    ) -> Result<Appended, StoreError> {
        deskline_proto::message::validate_content(content)?;

        let mut inner = self.inner.write().await;
        let Inner {
            sessions,
            client_ids,
        } = &mut *inner;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        check_access(author, session)?;

        if let Some(client_id) = client_id {
            let key = (id.clone(), client_id.clone());
            if let Some(existing) = client_ids
                .get(&key)
                .and_then(|perm| session.position_of(perm))
            {
                tracing::debug!(session_id = %id, temp_id = %client_id, "duplicate delivery");
                return Ok(Appended {
                    session_id: id.clone(),
                    message: session.messages[existing].clone(),
                    user: session.user.clone(),
                    duplicate: true,
                });
            }
        }

        if session.status == SessionStatus::Closed {
            return Err(StoreError::Closed(id.clone()));
        }

        if author.role == Role::Admin && session.admin.is_none() {
            session.admin = Some(author.user_id.clone());
            session.status = SessionStatus::Active;
            tracing::info!(session_id = %id, admin = %author.user_id, "admin assigned");
        }

        let message = Message::new(
            MessageId::new(Uuid::now_v7().simple().to_string()),
            author.role.sender_role(),
            content,
        );
        session.messages.push(message.clone());
        if let Some(client_id) = client_id {
            client_ids.insert((id.clone(), client_id.clone()), message.id.clone());
        }

        Ok(Appended {
            session_id: id.clone(),
            message,
            user: session.user.clone(),
            duplicate: false,
        })
    }

    /// Marks every counterpart message in the session as read by `reader`.
    ///
    /// Returns the number of messages whose flag changed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or [`StoreError::Forbidden`].
    pub async fn mark_read(&self, reader: &Principal, id: &SessionId) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        check_access(reader, session)?;

        let own = reader.role.sender_role();
        let mut changed = 0;
        for message in session
            .messages
            .iter_mut()
            .filter(|m| m.sender != own && !m.read)
        {
            message.mark_read();
            changed += 1;
        }
        Ok(changed)
    }

    /// Number of sessions in the store.
    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}

fn check_access(principal: &Principal, session: &ChatSession) -> Result<(), StoreError> {
    match principal.role {
        Role::Admin => Ok(()),
        Role::User if session.user == principal.user_id => Ok(()),
        Role::User => Err(StoreError::Forbidden(session.id.clone())),
    }
}

fn view_for(viewer: &Principal, session: &ChatSession) -> ChatSession {
    let own = viewer.role.sender_role();
    let unread = session
        .messages
        .iter()
        .filter(|m| m.sender != own && !m.read)
        .count();
    let mut view = session.clone();
    view.unread_count = u32::try_from(unread).unwrap_or(u32::MAX);
    view
}
