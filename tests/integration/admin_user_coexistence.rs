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

//! Several controllers sharing one runtime.
//!
//! The router is process-wide, so a user widget and one or more admin
//! consoles observe the same event types. These tests validate:
//! - Two admin consoles both receive a live message
//! - Detaching one controller removes only its own handlers
//! - A user and an admin controller interpret the same frame from their
//!   own side (counterpart or own message)
//! - `off` clears an event type for everyone, and a later detach only
//!   removes what is left

use std::sync::Arc;
use std::time::Duration;

use deskline::api::SessionApi;
use deskline::runtime::{ChatRuntime, RuntimeConfig};
use deskline::session::SessionEvent;
use deskline::transport::Identity;
use deskline_proto::frame::EventType;
use deskline_proto::message::{MessageId, SessionId, UserId};
use deskline_server::auth::Principal;
use deskline_server::hub::ServerState;
use tokio::sync::mpsc;
use tokio::time::Instant;

// =============================================================================
// Helpers
// =============================================================================

async fn start_server() -> (Arc<ServerState>, String) {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) =
        deskline_server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .expect("failed to start server");
    (state, addr.to_string())
}

fn runtime_config(addr: &str) -> RuntimeConfig {
    let mut config = RuntimeConfig::new(format!("http://{addr}/api"), format!("ws://{addr}/ws"));
    config.health_check_interval = None;
    config
}

async fn start_runtime(state: &ServerState, addr: &str, token: &str) -> Arc<ChatRuntime> {
    let runtime = Arc::new(ChatRuntime::new(runtime_config(addr)).unwrap());
    let (_, user) = token.split_once(':').unwrap();
    runtime
        .start(Identity::new(UserId::new(user), token))
        .await
        .unwrap();

    let principal = Principal::from_token(token).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.authenticated_count(&principal).await == 0 {
        assert!(Instant::now() < deadline, "{token} never authenticated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    runtime
}

async fn wait_appended(rx: &mut mpsc::Receiver<SessionEvent>, content: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(SessionEvent::MessageAppended { message, .. })) if message.content == content => {
                return;
            }
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timeout waiting for {content:?}"),
        }
    }
}

fn new_message_frame(session_id: &SessionId, id: &str, sender: &str, content: &str) -> String {
    serde_json::json!({
        "type": "new_message",
        "sessionId": session_id,
        "message": {
            "_id": id,
            "sender": sender,
            "content": content,
            "createdAt": "2024-03-01T10:00:00Z",
        },
    })
    .to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn two_admin_consoles_receive_until_one_detaches() {
    let (state, addr) = start_server().await;
    let user_rt = start_runtime(&state, &addr, "user:u1").await;
    let admin_rt = start_runtime(&state, &addr, "admin:a1").await;

    let session = user_rt.api().create_session().await.unwrap();
    let (user, _user_events) = user_rt.user_controller();
    user.open_session(&session.id).await.unwrap();

    let (first, mut first_events) = admin_rt.admin_controller();
    let (second, mut second_events) = admin_rt.admin_controller();
    first.open_session(&session.id).await.unwrap();
    second.open_session(&session.id).await.unwrap();
    assert_eq!(admin_rt.router().listener_count(&EventType::NewMessage), 2);

    user.send_message(&session.id, "one").await.unwrap();
    wait_appended(&mut first_events, "one").await;
    wait_appended(&mut second_events, "one").await;

    assert_eq!(first.detach(admin_rt.router()), 3);
    assert_eq!(admin_rt.router().listener_count(&EventType::NewMessage), 1);

    user.send_message(&session.id, "two").await.unwrap();
    wait_appended(&mut second_events, "two").await;
    assert_eq!(second.messages().len(), 2);
    assert_eq!(first.messages().len(), 1, "detached console no longer updates");
}

#[tokio::test]
async fn user_and_admin_read_the_same_frame_from_their_side() {
    let (_state, addr) = start_server().await;
    let runtime = Arc::new(ChatRuntime::new(runtime_config(&addr)).unwrap());
    runtime
        .login(Identity::new(UserId::new("u1"), "user:u1"))
        .await
        .unwrap();
    let session = runtime.api().create_session().await.unwrap();

    let (user, _user_events) = runtime.user_controller();
    let (admin, _admin_events) = runtime.admin_controller();
    user.open_session(&session.id).await.unwrap();
    admin.open_session(&session.id).await.unwrap();

    let report = runtime
        .router()
        .dispatch(&new_message_frame(&session.id, "m1", "admin", "hello from support"))
        .unwrap();
    assert_eq!(report.invoked, 2);
    assert_eq!(report.failed, 0);

    assert_eq!(user.messages().len(), 1);
    assert_eq!(admin.messages().len(), 1);
    assert!(user.read_receipt_due(), "admin reply is a counterpart message for the user");
    assert!(!admin.read_receipt_due(), "the admin's own message needs no receipt");
    assert_eq!(user.session().unwrap().unread_count, 1);
    assert_eq!(admin.session().unwrap().unread_count, 0);
}

#[tokio::test]
async fn off_clears_the_event_for_every_controller() {
    let (_state, addr) = start_server().await;
    let runtime = Arc::new(ChatRuntime::new(runtime_config(&addr)).unwrap());
    runtime
        .login(Identity::new(UserId::new("u1"), "user:u1"))
        .await
        .unwrap();
    let session = runtime.api().create_session().await.unwrap();

    let (user, _user_events) = runtime.user_controller();
    let (admin, _admin_events) = runtime.admin_controller();
    user.open_session(&session.id).await.unwrap();
    admin.open_session(&session.id).await.unwrap();

    assert_eq!(runtime.router().off(&EventType::NewMessage), 2);
    let report = runtime
        .router()
        .dispatch(&new_message_frame(&session.id, "m1", "user", "lost"))
        .unwrap();
    assert_eq!(report.invoked, 0);
    assert!(user.messages().is_empty());
    assert!(admin.messages().is_empty());

    // Acknowledgements still reach each controller.
    let ack = serde_json::json!({
        "type": "message_sent",
        "sessionId": session.id,
        "messageId": "m2",
        "tempId": MessageId::temporary(),
    })
    .to_string();
    assert_eq!(runtime.router().dispatch(&ack).unwrap().invoked, 2);

    // Only message_sent and message_error are left to remove.
    assert_eq!(user.detach(runtime.router()), 2);
    assert_eq!(admin.detach(runtime.router()), 2);
    assert_eq!(runtime.router().listener_count(&EventType::MessageSent), 0);
}
