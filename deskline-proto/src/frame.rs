//! JSON frames exchanged over the duplex channel.
//!
//! Every frame is a JSON object carrying a `type` tag. The client sends
//! [`OutboundFrame`]s and receives [`InboundFrame`]s. Inbound decoding reads
//! the tag first so that unknown frame types are preserved as
//! [`InboundFrame::Other`] instead of failing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, MessageId, SenderRole, SessionId, UserId};

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload is not valid JSON or does not match the frame shape.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The payload is a JSON value but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The object has no string `type` field.
    #[error("frame has no type tag")]
    MissingType,
    /// The frame type is not one this side accepts.
    #[error("unsupported frame type: {0}")]
    UnsupportedType(String),
}

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Deliver a chat message into a session.
    SendMessage(SendMessageFrame),
    /// Bind this channel to an account.
    Auth(AuthFrame),
}

/// Payload of an outbound `send_message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageFrame {
    /// Target session.
    pub session_id: SessionId,
    /// Message text.
    pub content: String,
    /// Role of the sending surface.
    pub sender: SenderRole,
    /// Account the message is addressed to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    /// Client-side send time.
    pub timestamp: DateTime<Utc>,
    /// Temporary ID of the optimistic message, echoed back in `message_sent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
}

/// Payload of an outbound `auth` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    /// Account to authenticate as.
    pub user_id: UserId,
    /// Bearer token for that account.
    pub token: String,
}

/// Payload of an inbound `new_message` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageFrame {
    /// Session the message belongs to.
    pub session_id: SessionId,
    /// The message as persisted by the server.
    pub message: Message,
}

/// Payload of an inbound `message_sent` acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentFrame {
    /// Session the message was stored in.
    pub session_id: SessionId,
    /// Permanent, server-assigned message ID.
    pub message_id: MessageId,
    /// Temporary ID supplied by the sender, if it sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
}

/// Payload of an inbound `message_error` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageErrorFrame {
    /// Session the failed send targeted, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Temporary ID of the failed send, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<MessageId>,
    /// Human-readable reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server-to-client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// A message was stored in a session this client observes.
    NewMessage(NewMessageFrame),
    /// A message this client sent over the channel was stored.
    MessageSent(MessageSentFrame),
    /// A message this client sent over the channel was rejected.
    MessageError(MessageErrorFrame),
    /// Any other frame type; the full object is kept in `body`.
    Other {
        /// Value of the `type` tag.
        kind: String,
        /// The whole frame object, including `type`.
        body: Value,
    },
}

impl InboundFrame {
    /// Builds a frame of a type without a dedicated variant.
    ///
    /// `fields` should be a JSON object; its `type` key is overwritten.
    pub fn custom(kind: impl Into<String>, fields: Value) -> Self {
        let kind = kind.into();
        let mut body = match fields {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(serde_json::Map::new()),
        };
        body["type"] = Value::String(kind.clone());
        Self::Other { kind, body }
    }

    /// Returns the routing key of this frame.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::NewMessage(_) => EventType::NewMessage,
            Self::MessageSent(_) => EventType::MessageSent,
            Self::MessageError(_) => EventType::MessageError,
            Self::Other { kind, .. } => EventType::from_type_tag(kind),
        }
    }
}

/// Routing key for inbound frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// `new_message`
    NewMessage,
    /// `message_sent`
    MessageSent,
    /// `message_error`
    MessageError,
    /// Any other `type` tag.
    Custom(String),
}

impl EventType {
    /// Maps a wire `type` tag to an event type.
    #[must_use]
    pub fn from_type_tag(tag: &str) -> Self {
        match tag {
            "new_message" => Self::NewMessage,
            "message_sent" => Self::MessageSent,
            "message_error" => Self::MessageError,
            other => Self::Custom(other.to_string()),
        }
    }

    /// Returns the wire `type` tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::NewMessage => "new_message",
            Self::MessageSent => "message_sent",
            Self::MessageError => "message_error",
            Self::Custom(tag) => tag,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encodes an outbound frame as a JSON text payload.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if serialization fails.
pub fn encode_outbound(frame: &OutboundFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decodes an outbound frame (server side).
///
/// # Errors
///
/// Returns [`FrameError`] when the payload is not a known outbound frame.
pub fn decode_outbound(text: &str) -> Result<OutboundFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let tag = type_tag(&value)?;
    match tag {
        "send_message" | "auth" => Ok(serde_json::from_value(value)?),
        other => Err(FrameError::UnsupportedType(other.to_string())),
    }
}

/// Decodes an inbound frame from a JSON text payload.
///
/// Known types are parsed into their typed variants; a known type whose
/// fields do not match is an error. Unknown types become
/// [`InboundFrame::Other`].
///
/// # Errors
///
/// Returns [`FrameError`] for invalid JSON, non-object payloads, a missing
/// `type` tag, or a known type with a malformed body.
pub fn decode_inbound(text: &str) -> Result<InboundFrame, FrameError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = type_tag(&value)?.to_string();
    let frame = match EventType::from_type_tag(&kind) {
        EventType::NewMessage => InboundFrame::NewMessage(serde_json::from_value(value)?),
        EventType::MessageSent => InboundFrame::MessageSent(serde_json::from_value(value)?),
        EventType::MessageError => InboundFrame::MessageError(serde_json::from_value(value)?),
        EventType::Custom(_) => InboundFrame::Other { kind, body: value },
    };
    Ok(frame)
}

/// Encodes an inbound frame as a JSON text payload (server side).
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if serialization fails.
pub fn encode_inbound(frame: &InboundFrame) -> Result<String, FrameError> {
    let value = match frame {
        InboundFrame::NewMessage(inner) => tagged("new_message", serde_json::to_value(inner)?),
        InboundFrame::MessageSent(inner) => tagged("message_sent", serde_json::to_value(inner)?),
        InboundFrame::MessageError(inner) => {
            tagged("message_error", serde_json::to_value(inner)?)
        }
        InboundFrame::Other { body, .. } => body.clone(),
    };
    Ok(serde_json::to_string(&value)?)
}

fn type_tag(value: &Value) -> Result<&str, FrameError> {
    let object = value.as_object().ok_or(FrameError::NotAnObject)?;
    object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)
}

fn tagged(tag: &str, mut value: Value) -> Value {
    if let Value::Object(map) = &mut value {
        map.insert("type".to_string(), Value::String(tag.to_string()));
    }
    value
}
