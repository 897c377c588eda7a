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

//! End-to-end send and receive between an end user and an admin.
//!
//! Each side runs its own `ChatRuntime` (as two separate clients would)
//! against an in-process server. These tests validate:
//! - A user message is acknowledged over the channel and its temporary ID
//!   replaced in place
//! - The admin console receives it live and flags a read receipt
//! - Dual-send stores exactly one copy on the server
//! - Replies flow back and `mark_read` reaches the server
//! - Messages for a session that is not open only bump its unread count

use std::sync::Arc;
use std::time::Duration;

use deskline::api::SessionApi;
use deskline::runtime::{ChatRuntime, RuntimeConfig};
use deskline::session::SessionEvent;
use deskline::transport::Identity;
use deskline_proto::message::{SenderRole, SessionId, UserId};
use deskline_server::auth::Principal;
use deskline_server::hub::ServerState;
use tokio::sync::mpsc;
use tokio::time::Instant;

// =============================================================================
// Helpers
// =============================================================================

/// Start a server with a shared state handle, return (state, "host:port").
async fn start_server() -> (Arc<ServerState>, String) {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) =
        deskline_server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .expect("failed to start server");
    (state, addr.to_string())
}

/// Start a runtime signed in with a development token (`role:user`).
async fn start_runtime(addr: &str, token: &str) -> Arc<ChatRuntime> {
    let mut config = RuntimeConfig::new(format!("http://{addr}/api"), format!("ws://{addr}/ws"));
    config.health_check_interval = None;
    let runtime = Arc::new(ChatRuntime::new(config).unwrap());
    let (_, user) = token.split_once(':').unwrap();
    runtime
        .start(Identity::new(UserId::new(user), token))
        .await
        .unwrap();
    runtime
}

/// Wait until the server has processed the auth frame for `token`.
async fn wait_authenticated(state: &ServerState, token: &str) {
    let principal = Principal::from_token(token).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.authenticated_count(&principal).await == 0 {
        assert!(Instant::now() < deadline, "{token} never authenticated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait for a session event matching `pred`, skipping others.
async fn wait_for_event<F>(
    rx: &mut mpsc::Receiver<SessionEvent>,
    description: &str,
    pred: F,
) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) if pred(&event) => return event,
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("event channel closed while waiting for {description}"),
            Err(_) => panic!("timeout waiting for {description}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn user_message_reaches_admin_and_is_stored_once() {
    let (state, addr) = start_server().await;
    let user_rt = start_runtime(&addr, "user:u1").await;
    let admin_rt = start_runtime(&addr, "admin:a1").await;
    wait_authenticated(&state, "user:u1").await;
    wait_authenticated(&state, "admin:a1").await;

    let session = user_rt.api().create_session().await.unwrap();
    let (user, mut user_events) = user_rt.user_controller();
    user.open_session(&session.id).await.unwrap();
    let (admin, mut admin_events) = admin_rt.admin_controller();
    admin.open_session(&session.id).await.unwrap();

    let temp = user.send_message(&session.id, "hello").await.unwrap();
    assert!(temp.is_temporary());

    let SessionEvent::MessageReconciled {
        temp_id, message_id, ..
    } = wait_for_event(&mut user_events, "ack", |e| {
        matches!(e, SessionEvent::MessageReconciled { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(temp_id, temp);
    let messages = user.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, message_id);

    wait_for_event(&mut admin_events, "admin copy", |e| {
        matches!(e, SessionEvent::MessageAppended { message, .. } if message.content == "hello")
    })
    .await;
    assert!(admin.read_receipt_due());
    assert_eq!(admin.messages()[0].id, message_id);

    let stored = admin_rt.api().get_session(&session.id).await.unwrap();
    assert_eq!(stored.messages.len(), 1, "channel and REST copies collapse");
}

#[tokio::test]
async fn admin_reply_reaches_user_and_read_receipt_is_recorded() {
    let (state, addr) = start_server().await;
    let user_rt = start_runtime(&addr, "user:u1").await;
    let admin_rt = start_runtime(&addr, "admin:a1").await;
    wait_authenticated(&state, "user:u1").await;
    wait_authenticated(&state, "admin:a1").await;

    let session = user_rt.api().create_session().await.unwrap();
    let (user, mut user_events) = user_rt.user_controller();
    user.open_session(&session.id).await.unwrap();
    let (admin, _admin_events) = admin_rt.admin_controller();
    admin.open_session(&session.id).await.unwrap();

    admin
        .send_message(&session.id, "how can I help?")
        .await
        .unwrap();

    wait_for_event(&mut user_events, "reply", |e| {
        matches!(e, SessionEvent::ReadReceiptDue { .. })
    })
    .await;
    let messages = user.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, SenderRole::Admin);
    assert!(!messages[0].read);

    user.mark_read().await.unwrap();
    assert!(user.messages()[0].read);
    assert!(!user.read_receipt_due());

    let stored = admin_rt.api().get_session(&session.id).await.unwrap();
    assert!(stored.messages[0].read);
    assert_eq!(stored.admin, Some(UserId::new("a1")));
}

#[tokio::test]
async fn message_for_background_session_only_bumps_unread() {
    let (state, addr) = start_server().await;
    let first_rt = start_runtime(&addr, "user:u1").await;
    let second_rt = start_runtime(&addr, "user:u2").await;
    let admin_rt = start_runtime(&addr, "admin:a1").await;
    wait_authenticated(&state, "admin:a1").await;

    let open = first_rt.api().create_session().await.unwrap();
    let background = second_rt.api().create_session().await.unwrap();

    let (admin, mut admin_events) = admin_rt.admin_controller();
    admin.refresh_sessions().await.unwrap();
    admin.open_session(&open.id).await.unwrap();

    let (second, _events) = second_rt.user_controller();
    second.open_session(&background.id).await.unwrap();
    second
        .send_message(&background.id, "are you there?")
        .await
        .unwrap();

    let event = wait_for_event(&mut admin_events, "unread bump", |e| {
        matches!(e, SessionEvent::UnreadChanged { .. })
    })
    .await;
    assert_eq!(
        event,
        SessionEvent::UnreadChanged {
            session_id: background.id.clone(),
            unread_count: 1
        }
    );
    assert!(admin.messages().is_empty());
    assert_eq!(admin.open_session_id(), Some(open.id));
    assert_eq!(admin.unread_count(&background.id), Some(1));
    assert_eq!(admin.unread_count(&SessionId::new("unknown")), None);
}
