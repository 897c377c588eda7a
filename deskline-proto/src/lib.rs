//! Shared protocol definitions for the Deskline messaging core.
//!
//! [`message`] holds the session/message data model used by both the
//! WebSocket frames and the REST fallback; [`frame`] holds the JSON frame
//! codec for the duplex channel.

pub mod frame;
pub mod message;
