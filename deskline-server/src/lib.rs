//! Deskline development server library.
//!
//! An in-memory server speaking the Deskline WebSocket frame protocol and
//! the session REST API. Used by integration tests and for local runs.

pub mod auth;
pub mod config;
pub mod hub;
pub mod rest;
pub mod store;

use std::sync::Arc;

use hub::ServerState;

/// Paths the server mounts its endpoints under.
#[derive(Debug, Clone)]
pub struct Routes {
    /// Path of the WebSocket endpoint.
    pub ws_path: String,
    /// Prefix of the REST API; `/` mounts it at the root.
    pub api_prefix: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            ws_path: "/ws".to_string(),
            api_prefix: "/api".to_string(),
        }
    }
}

/// Builds the axum application for the given state and routes.
pub fn app(state: Arc<ServerState>, routes: &Routes) -> axum::Router {
    let router = axum::Router::new().route(&routes.ws_path, axum::routing::get(hub::ws_handler));
    let prefix = routes.api_prefix.trim_end_matches('/');
    let router = if prefix.is_empty() {
        router.merge(rest::routes())
    } else {
        router.nest(prefix, rest::routes())
    };
    router.with_state(state)
}

/// Starts the server on `addr` with a fresh state and default routes.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the server with a caller-owned [`ServerState`] and default routes.
///
/// Keeping a handle on the state lets tests inspect the store and call
/// [`ServerState::close_all_connections`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_routes(addr, state, &Routes::default()).await
}

/// Starts the server with a caller-owned state and custom routes.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_routes(
    addr: &str,
    state: Arc<ServerState>,
    routes: &Routes,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = app(state, routes);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
