//! Configuration system for the Deskline client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/deskline/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use deskline_proto::message::{SessionId, UserId};

use crate::runtime::RuntimeConfig;
use crate::session::{DeliveryPolicy, Surface};
use crate::transport::{
    ConnectionConfig, Identity, ReconnectPolicy, TransportError, ws_url_from_base,
};

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The WebSocket URL could not be derived from the API base URL.
    #[error("invalid server address: {0}")]
    InvalidAddress(#[from] TransportError),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    delivery: DeliveryFileConfig,
    chat: ChatFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    api_base: Option<String>,
    ws_path: Option<String>,
    user_id: Option<String>,
    token: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
    health_check_secs: Option<u64>,
}

/// `[delivery]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeliveryFileConfig {
    dual_send: Option<bool>,
    queue_when_offline: Option<bool>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    event_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Base URL of the REST API; the WebSocket URL is derived from it.
    pub api_base: String,
    /// Path of the WebSocket endpoint on the API host.
    pub ws_path: String,
    /// Account to authenticate as.
    pub user_id: Option<String>,
    /// Bearer token; see [`identity`](Self::identity) for the default.
    pub token: Option<String>,
    /// Which side of the conversation this client is.
    pub surface: Surface,
    /// Session to open on startup.
    pub session: Option<String>,
    /// Bound on the WebSocket opening handshake.
    pub connect_timeout: Duration,
    /// Timeout for each REST request.
    pub request_timeout: Duration,

    // -- Reconnect --
    /// Automatic reconnection backoff.
    pub reconnect: ReconnectPolicy,
    /// Period of the background health check; zero disables it.
    pub health_check_interval: Duration,

    // -- Delivery --
    /// How sends use the channel and REST paths.
    pub delivery: DeliveryPolicy,

    // -- Chat --
    /// Buffer size for each controller's event channel.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:5000/api".to_string(),
            ws_path: "/ws".to_string(),
            user_id: None,
            token: None,
            surface: Surface::User,
            session: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            health_check_interval: Duration::from_secs(60),
            delivery: DeliveryPolicy::default(),
            event_buffer: 64,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path (`~/.config/deskline/config.toml`)
    /// is tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` so it can be
    /// tested without CLI parsing.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let reconnect = ReconnectPolicy {
            base_delay: file
                .reconnect
                .base_delay_ms
                .map_or(defaults.reconnect.base_delay, Duration::from_millis),
            max_delay: file
                .reconnect
                .max_delay_secs
                .map_or(defaults.reconnect.max_delay, Duration::from_secs),
            max_attempts: file
                .reconnect
                .max_attempts
                .unwrap_or(defaults.reconnect.max_attempts),
        };

        Self {
            api_base: cli
                .api_base
                .clone()
                .or_else(|| file.network.api_base.clone())
                .unwrap_or(defaults.api_base),
            ws_path: file.network.ws_path.clone().unwrap_or(defaults.ws_path),
            user_id: cli.user.clone().or_else(|| file.network.user_id.clone()),
            token: cli.token.clone().or_else(|| file.network.token.clone()),
            surface: if cli.admin {
                Surface::Admin
            } else {
                Surface::User
            },
            session: cli.session.clone(),
            connect_timeout: file
                .network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: file
                .network
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            reconnect,
            health_check_interval: file
                .reconnect
                .health_check_secs
                .map_or(defaults.health_check_interval, Duration::from_secs),
            delivery: DeliveryPolicy {
                dual_send: file
                    .delivery
                    .dual_send
                    .unwrap_or(defaults.delivery.dual_send),
                queue_when_offline: file
                    .delivery
                    .queue_when_offline
                    .unwrap_or(defaults.delivery.queue_when_offline),
            },
            event_buffer: file.chat.event_buffer.unwrap_or(defaults.event_buffer),
        }
    }

    /// The identity to authenticate as, if a user ID is configured.
    ///
    /// Without an explicit token, the development-server token
    /// `<surface>:<userId>` is used.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        let user = self.user_id.clone().filter(|u| !u.is_empty())?;
        let token = self
            .token
            .clone()
            .unwrap_or_else(|| format!("{}:{user}", self.surface));
        Some(Identity::new(UserId::new(user), token))
    }

    /// Session to open on startup, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_deref().map(SessionId::new)
    }

    /// Build the [`RuntimeConfig`] for this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] if no WebSocket URL can be
    /// derived from `api_base`.
    pub fn to_runtime_config(&self) -> Result<RuntimeConfig, ConfigError> {
        let ws_url = ws_url_from_base(&self.api_base, &self.ws_path)?;
        Ok(RuntimeConfig {
            connection: ConnectionConfig {
                ws_url,
                connect_timeout: self.connect_timeout,
                reconnect: self.reconnect,
            },
            api_base: self.api_base.clone(),
            request_timeout: self.request_timeout,
            policy: self.delivery,
            event_buffer: self.event_buffer,
            health_check_interval: Some(self.health_check_interval)
                .filter(|interval| !interval.is_zero()),
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Customer-service chat client")]
pub struct CliArgs {
    /// Base URL of the REST API (e.g. `http://localhost:5000/api`).
    #[arg(long, env = "DESKLINE_API")]
    pub api_base: Option<String>,

    /// Account ID to sign in as.
    #[arg(long, env = "DESKLINE_USER")]
    pub user: Option<String>,

    /// Bearer token (defaults to a development token for `--user`).
    #[arg(long, env = "DESKLINE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Act as a support-desk admin instead of an end user.
    #[arg(long)]
    pub admin: bool,

    /// Session to open on startup.
    #[arg(long)]
    pub session: Option<String>,

    /// Path to config file (default: `~/.config/deskline/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "DESKLINE_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/deskline.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("deskline").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
