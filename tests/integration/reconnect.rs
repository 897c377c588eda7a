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

//! Automatic reconnection of the realtime channel.
//!
//! These tests validate:
//! - A server-initiated abnormal close (code 1012) triggers a reconnect
//!   with backoff, the attempt counter resets on success, and the socket
//!   is authenticated again
//! - Once the attempt budget is spent the channel stays down until the
//!   health check reopens it
//! - Messages queued during the outage are replayed after the reopen and
//!   acknowledged, with the server keeping a single copy
//!
//! ## Disconnect simulation
//!
//! Stopping the server task does not close sockets that are already
//! upgraded. A TCP proxy sits between the client channel and the server
//! instead; killing it aborts every proxied connection and releases the
//! port, so the client sees a read error and further connects are refused.

use std::sync::Arc;
use std::time::Duration;

use deskline::api::SessionApi;
use deskline::runtime::{ChatRuntime, RuntimeConfig};
use deskline::session::{DeliveryPolicy, SessionEvent};
use deskline::transport::{ChannelState, ConnectionStatus, Identity, ReconnectPolicy, Transport};
use deskline_proto::message::UserId;
use deskline_server::auth::Principal;
use deskline_server::hub::ServerState;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

// =============================================================================
// TCP Proxy helper
// =============================================================================

/// Forwards a client-facing port to the server. `kill()` aborts every
/// connection task, tearing down both directions of each proxied stream.
struct TcpProxy {
    accept_handle: tokio::task::JoinHandle<()>,
    conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TcpProxy {
    /// Listen on `proxy_port` and forward to `backend_addr`.
    async fn new(proxy_port: u16, backend_addr: &str) -> Self {
        let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{proxy_port}"))
            .await
            .unwrap_or_else(|e| panic!("proxy: failed to bind to port {proxy_port}: {e}"));
        let backend = backend_addr.to_string();
        let conn_handles: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));
        let tracked = Arc::clone(&conn_handles);

        let accept_handle = tokio::spawn(async move {
            while let Ok((mut client_stream, _)) = listener.accept().await {
                let backend = backend.clone();
                let conn_handle = tokio::spawn(async move {
                    let Ok(mut backend_stream) = tokio::net::TcpStream::connect(&backend).await
                    else {
                        return;
                    };
                    // No sub-tasks, so aborting this one drops both streams.
                    let _ = tokio::io::copy_bidirectional(&mut client_stream, &mut backend_stream)
                        .await;
                });
                tracked.lock().push(conn_handle);
            }
        });

        Self {
            accept_handle,
            conn_handles,
        }
    }

    /// Sever all connections and stop listening.
    fn kill(self) {
        self.accept_handle.abort();
        for h in self.conn_handles.lock().iter() {
            h.abort();
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Find a free port by binding to 0 and recording the port.
async fn find_free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind to port 0");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    // Brief pause to let the OS release the port.
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

async fn start_server() -> (Arc<ServerState>, String) {
    let state = Arc::new(ServerState::new());
    let (addr, _handle) =
        deskline_server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
            .await
            .expect("failed to start server");
    (state, addr.to_string())
}

/// Runtime for `user:u1` with fast backoff and channel-only delivery, so an
/// acknowledgement proves the socket is authenticated.
fn fast_runtime(api_addr: &str, ws_addr: &str, max_attempts: u32, queue_when_offline: bool) -> Arc<ChatRuntime> {
    let mut config =
        RuntimeConfig::new(format!("http://{api_addr}/api"), format!("ws://{ws_addr}/ws"));
    config.health_check_interval = None;
    config.connection.connect_timeout = Duration::from_millis(500);
    config.connection.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_attempts,
    };
    config.policy = DeliveryPolicy {
        dual_send: false,
        queue_when_offline,
    };
    Arc::new(ChatRuntime::new(config).unwrap())
}

fn identity() -> Identity {
    Identity::new(UserId::new("u1"), "user:u1")
}

/// Wait for a status snapshot matching `pred`.
async fn wait_status<F>(runtime: &ChatRuntime, description: &str, pred: F) -> ConnectionStatus
where
    F: FnMut(&ConnectionStatus) -> bool,
{
    let mut rx = runtime.connection().subscribe_status();
    let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .unwrap_or_else(|_| panic!("timeout waiting for {description}"))
        .expect("status channel closed");
    *status
}

/// Wait until exactly one socket is registered and it is authenticated.
async fn wait_single_authenticated(state: &ServerState) {
    let principal = Principal::from_token("user:u1").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while state.connection_count().await != 1 || state.authenticated_count(&principal).await != 1 {
        assert!(Instant::now() < deadline, "socket never re-authenticated");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_reconciled(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event @ SessionEvent::MessageReconciled { .. })) => return event,
            Ok(Some(_other)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timeout waiting for acknowledgement"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn server_restart_close_reconnects_and_reauthenticates() {
    let (state, addr) = start_server().await;
    let runtime = fast_runtime(&addr, &addr, 5, false);
    runtime.start(identity()).await.unwrap();
    wait_single_authenticated(&state).await;

    let session = runtime.api().create_session().await.unwrap();
    let (user, mut events) = runtime.user_controller();
    user.open_session(&session.id).await.unwrap();

    state.close_all_connections().await;

    let scheduled = wait_status(&runtime, "reconnect scheduled", |s| s.attempts >= 1).await;
    assert!(!scheduled.exhausted);
    let reopened = wait_status(&runtime, "channel reopened", |s| {
        s.state == ChannelState::Open
    })
    .await;
    assert_eq!(reopened.attempts, 0, "attempts reset after a successful open");
    wait_single_authenticated(&state).await;

    let temp = user.send_message(&session.id, "still there?").await.unwrap();
    let SessionEvent::MessageReconciled { temp_id, .. } = wait_reconciled(&mut events).await else {
        unreachable!()
    };
    assert_eq!(temp_id, temp);
    runtime.shutdown().await;
}

#[tokio::test]
async fn exhausted_reconnect_resumes_on_health_check() {
    let (_state, addr) = start_server().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &addr).await;
    let runtime = fast_runtime(&addr, &format!("127.0.0.1:{proxy_port}"), 2, false);
    runtime.start(identity()).await.unwrap();
    assert_eq!(runtime.connection().state(), ChannelState::Open);

    proxy.kill();
    let exhausted = wait_status(&runtime, "exhaustion", |s| s.exhausted).await;
    assert_eq!(exhausted.state, ChannelState::Disconnected);
    assert_eq!(exhausted.attempts, 2);

    // Still unreachable: the health check reports the failure.
    assert!(runtime.health_check().await.is_err());
    assert_eq!(runtime.connection().state(), ChannelState::Disconnected);

    let _proxy = TcpProxy::new(proxy_port, &addr).await;
    assert!(runtime.health_check().await.unwrap());
    let status = runtime.connection().status();
    assert_eq!(status.state, ChannelState::Open);
    assert_eq!(status.attempts, 0);
    assert!(!status.exhausted);

    // Nothing to do while open.
    assert!(!runtime.health_check().await.unwrap());
    runtime.shutdown().await;
    assert!(!runtime.health_check().await.unwrap(), "manual close is respected");
}

#[tokio::test]
async fn messages_queued_during_outage_flush_after_reopen() {
    let (state, addr) = start_server().await;
    let proxy_port = find_free_port().await;
    let proxy = TcpProxy::new(proxy_port, &addr).await;
    let runtime = fast_runtime(&addr, &format!("127.0.0.1:{proxy_port}"), 1, true);
    runtime.start(identity()).await.unwrap();

    let session = runtime.api().create_session().await.unwrap();
    let (user, mut events) = runtime.user_controller();
    user.open_session(&session.id).await.unwrap();

    proxy.kill();
    wait_status(&runtime, "exhaustion", |s| s.exhausted).await;

    // REST still works; the channel copy waits in the queue.
    let temp = user.send_message(&session.id, "while away").await.unwrap();
    assert_eq!(runtime.queue().len(), 1);
    assert_eq!(runtime.queue().snapshot()[0].temp_id, temp);

    let _proxy = TcpProxy::new(proxy_port, &addr).await;
    assert!(runtime.health_check().await.unwrap());

    let SessionEvent::MessageReconciled {
        temp_id,
        message_id,
        ..
    } = wait_reconciled(&mut events).await
    else {
        unreachable!()
    };
    assert_eq!(temp_id, temp);
    assert!(runtime.queue().is_empty());
    assert_eq!(user.messages()[0].id, message_id);

    let stored = state
        .store
        .get(&Principal::from_token("user:u1").unwrap(), &session.id)
        .await
        .unwrap();
    assert_eq!(stored.messages.len(), 1);
    runtime.shutdown().await;
}
