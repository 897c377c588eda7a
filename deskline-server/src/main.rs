//! Deskline development server.
//!
//! An axum server holding sessions in memory and speaking the Deskline
//! WebSocket and REST protocol. Authenticate with tokens of the form
//! `user:<id>` or `admin:<id>`.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:5000
//! cargo run --bin deskline-server
//!
//! # Run on custom address with the API at the root
//! cargo run --bin deskline-server -- --bind 127.0.0.1:8080 --api-prefix /
//! ```

use std::sync::Arc;

use clap::Parser;
use deskline_server::Routes;
use deskline_server::config::{ServerCliArgs, ServerConfig};
use deskline_server::hub::ServerState;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting deskline server");

    let routes = Routes {
        ws_path: config.ws_path.clone(),
        api_prefix: config.api_prefix.clone(),
    };
    let state = Arc::new(ServerState::new());

    match deskline_server::start_server_with_routes(&config.bind_addr, state, &routes).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(
                addr = %bound_addr,
                ws_path = %routes.ws_path,
                api_prefix = %routes.api_prefix,
                "server listening"
            );
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }
}
