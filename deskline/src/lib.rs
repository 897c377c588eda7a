//! Real-time customer-service messaging client core.
//!
//! One [`runtime::ChatRuntime`] per process owns the WebSocket channel, the
//! outbound queue, the inbound router and the REST client; session
//! controllers for the user widget and the admin console are created from it.

pub mod api;
pub mod config;
pub mod queue;
pub mod router;
pub mod runtime;
pub mod session;
pub mod transport;
