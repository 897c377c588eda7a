//! Data model shared by the Deskline client, server, and REST layer.
//!
//! Identifiers follow the document-store convention of the backing service:
//! every persisted entity carries its identifier in an `_id` field, and all
//! other fields are `camelCase` on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed message content length in characters.
pub const MAX_CONTENT_CHARS: usize = 5000;

/// Identifier of a chat message.
///
/// A message starts life with a client-generated temporary ID (see
/// [`MessageId::temporary`]) and is later given a server-assigned ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Prefix carried by every client-generated temporary ID.
    pub const TEMP_PREFIX: &'static str = "temp_";

    /// Wraps an existing identifier (usually server-assigned).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a unique, time-ordered temporary ID (`temp_<uuid-v7>`).
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{}{}", Self::TEMP_PREFIX, Uuid::now_v7().simple()))
    }

    /// Returns `true` if this ID was generated locally and not yet replaced.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(Self::TEMP_PREFIX)
    }

    /// Returns the string form of this ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned identifier of a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an existing session identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an end user or an admin account.
///
/// The default (empty) ID stands for an account not known locally yet.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps an existing account identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    /// The end user who opened the session.
    User,
    /// A support-desk operator.
    Admin,
    /// Generated by the service (greetings, assignment notices).
    System,
}

impl std::fmt::Display for SenderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Admin => f.write_str("admin"),
            Self::System => f.write_str("system"),
        }
    }
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Temporary or permanent identifier.
    #[serde(rename = "_id")]
    pub id: MessageId,
    /// Author role.
    pub sender: SenderRole,
    /// Message text.
    pub content: String,
    /// Whether the receiving side has read this message.
    #[serde(default)]
    pub read: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Builds an unread message created now.
    pub fn new(id: MessageId, sender: SenderRole, content: impl Into<String>) -> Self {
        Self {
            id,
            sender,
            content: content.into(),
            read: false,
            created_at: Utc::now(),
        }
    }

    /// Marks the message as read.
    pub const fn mark_read(&mut self) {
        self.read = true;
    }

    /// Merges a read flag observed in a later event.
    ///
    /// The flag is monotonic: once `true` it stays `true`.
    pub const fn merge_read(&mut self, read: bool) {
        self.read = self.read || read;
    }
}

/// Lifecycle status of a chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// An admin is attached and the conversation is live.
    Active,
    /// Opened by the user, no admin attached yet.
    #[default]
    Waiting,
    /// Closed by either side.
    Closed,
}

/// A conversation between one end user and the support desk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    /// Stable server-assigned session ID.
    #[serde(rename = "_id")]
    pub id: SessionId,
    /// The end user who owns the session.
    pub user: UserId,
    /// The admin handling the session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<UserId>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: SessionStatus,
    /// Messages in arrival/send order.
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Number of messages not yet read by the viewing side.
    #[serde(default)]
    pub unread_count: u32,
}

impl ChatSession {
    /// Creates an empty waiting session for `user`.
    #[must_use]
    pub const fn new(id: SessionId, user: UserId) -> Self {
        Self {
            id,
            user,
            admin: None,
            status: SessionStatus::Waiting,
            messages: Vec::new(),
            unread_count: 0,
        }
    }

    /// Returns the position of the message with `id`, if present.
    #[must_use]
    pub fn position_of(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == *id)
    }

    /// Derives the list-view summary of this session.
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            user: self.user.clone(),
            admin: self.admin.clone(),
            status: self.status,
            unread_count: self.unread_count,
            last_message: self.messages.last().cloned(),
        }
    }
}

/// Lightweight view of a session, as shown in a session list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session ID.
    #[serde(rename = "_id")]
    pub id: SessionId,
    /// The end user who owns the session.
    pub user: UserId,
    /// The admin handling the session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<UserId>,
    /// Lifecycle status.
    #[serde(default)]
    pub status: SessionStatus,
    /// Unread message count for the viewing side.
    #[serde(default)]
    pub unread_count: u32,
    /// Most recent message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Message>,
}

/// Error returned when message content fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Content is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds [`MAX_CONTENT_CHARS`].
    #[error("message too long ({len} chars, max {max} chars)")]
    TooLong {
        /// Actual length in characters.
        len: usize,
        /// Maximum allowed length in characters.
        max: usize,
    },
}

/// Validates outgoing message content.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] for empty or whitespace-only content
/// and [`ValidationError::TooLong`] above [`MAX_CONTENT_CHARS`].
pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    if content.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = content.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(ValidationError::TooLong {
            len,
            max: MAX_CONTENT_CHARS,
        });
    }
    Ok(())
}
