// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::manual_let_else,
    clippy::future_not_send,
    clippy::redundant_pub_crate,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::missing_docs_in_private_items
)]

//! Sending while the realtime channel is down.
//!
//! These tests validate:
//! - With the channel disconnected a send goes over REST only, the
//!   optimistic message keeps its temporary ID, and exactly one message is
//!   stored
//! - When REST also fails the optimistic message is rolled back and the
//!   text handed back to the caller
//! - With `queue_when_offline` the message is also replayed over the
//!   channel once it opens, and the server still keeps one copy

use std::sync::Arc;
use std::time::Duration;

use deskline::api::SessionApi;
use deskline::runtime::{ChatRuntime, RuntimeConfig};
use deskline::session::{DeliveryPolicy, SendError, SessionEvent};
use deskline::transport::{ChannelState, Identity, Transport};
use deskline_proto::message::UserId;
use tokio::time::Instant;

// =============================================================================
// Helpers
// =============================================================================

/// Start a server on an OS-assigned port, return "host:port".
async fn start_server() -> String {
    let (addr, _handle) = deskline_server::start_server("127.0.0.1:0")
        .await
        .expect("failed to start server");
    addr.to_string()
}

/// A runtime signed in as `user:u1` whose channel has not been opened.
async fn offline_runtime(api_addr: &str, ws_addr: &str, policy: DeliveryPolicy) -> Arc<ChatRuntime> {
    let mut config =
        RuntimeConfig::new(format!("http://{api_addr}/api"), format!("ws://{ws_addr}/ws"));
    config.health_check_interval = None;
    config.connection.connect_timeout = Duration::from_millis(500);
    config.policy = policy;
    let runtime = Arc::new(ChatRuntime::new(config).unwrap());
    runtime
        .login(Identity::new(UserId::new("u1"), "user:u1"))
        .await
        .unwrap();
    runtime
}

async fn wait_until<F: Fn() -> bool>(description: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timeout waiting for {description}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn disconnected_send_uses_rest_and_keeps_temp_id() {
    let addr = start_server().await;
    // Nothing listens on port 1, so the channel never opens.
    let runtime = offline_runtime(&addr, "127.0.0.1:1", DeliveryPolicy::default()).await;
    let session = runtime.api().create_session().await.unwrap();
    let (user, mut events) = runtime.user_controller();
    user.open_session(&session.id).await.unwrap();
    assert_eq!(runtime.connection().state(), ChannelState::Disconnected);

    let temp = user.send_message(&session.id, "hello").await.unwrap();

    let messages = user.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "hello");
    assert_eq!(messages[0].id, temp, "no channel ack, so the ID is unchanged");
    assert!(runtime.queue().is_empty());

    let stored = runtime.api().get_session(&session.id).await.unwrap();
    assert_eq!(stored.messages.len(), 1);
    assert_eq!(stored.messages[0].content, "hello");

    let _loaded = events.recv().await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::MessageAppended { .. }
    ));
}

#[tokio::test]
async fn rest_failure_rolls_back_and_returns_text() {
    let addr = start_server().await;
    let healthy = offline_runtime(&addr, "127.0.0.1:1", DeliveryPolicy::default()).await;
    let session = healthy.api().create_session().await.unwrap();
    let (user, _events) = healthy.user_controller();
    user.open_session(&session.id).await.unwrap();
    user.send_message(&session.id, "first").await.unwrap();

    // Same account, but the API is unreachable.
    let broken = offline_runtime("127.0.0.1:1", "127.0.0.1:1", DeliveryPolicy::default()).await;
    let (broken_user, mut events) = broken.user_controller();
    assert!(broken_user.open_session(&session.id).await.is_err());

    let failure = broken_user
        .send_message(&session.id, "try again later")
        .await
        .unwrap_err();
    assert_eq!(failure.content, "try again later");
    assert!(matches!(failure.source, SendError::Api(_)));
    assert!(broken.queue().is_empty());

    // The session never opened here, so only the rollback event is seen.
    match events.recv().await.unwrap() {
        SessionEvent::MessageRolledBack { content, .. } => assert_eq!(content, "try again later"),
        other => panic!("expected rollback, got {other:?}"),
    }

    let stored = healthy.api().get_session(&session.id).await.unwrap();
    assert_eq!(stored.messages.len(), 1);
}

#[tokio::test]
async fn rollback_only_touches_the_open_session() {
    let addr = start_server().await;
    let healthy = offline_runtime(&addr, "127.0.0.1:1", DeliveryPolicy::default()).await;
    let session = healthy.api().create_session().await.unwrap();
    let (user, _events) = healthy.user_controller();
    user.open_session(&session.id).await.unwrap();
    user.send_message(&session.id, "kept").await.unwrap();

    let failure = user
        .send_message(&deskline_proto::message::SessionId::new("missing"), "nowhere")
        .await
        .unwrap_err();
    assert_eq!(failure.content, "nowhere");
    let messages = user.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, "kept");
}

#[tokio::test]
async fn queued_offline_message_is_replayed_once_channel_opens() {
    let addr = start_server().await;
    let policy = DeliveryPolicy {
        dual_send: true,
        queue_when_offline: true,
    };
    let runtime = offline_runtime(&addr, &addr, policy).await;
    let session = runtime.api().create_session().await.unwrap();
    let (user, _events) = runtime.user_controller();
    user.open_session(&session.id).await.unwrap();

    // The channel is closed at send time; the send asks it to connect.
    user.send_message(&session.id, "catch up").await.unwrap();

    wait_until("channel open", || {
        runtime.connection().state() == ChannelState::Open
    })
    .await;
    wait_until("queue flushed", || runtime.queue().is_empty()).await;

    let stored = runtime.api().get_session(&session.id).await.unwrap();
    assert_eq!(stored.messages.len(), 1, "REST and replayed copies collapse");
    runtime.shutdown().await;
}
