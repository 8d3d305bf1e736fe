//! TOML configuration for the input server.
//!
//! The file path is given on the command line (default `oinputserver.toml`).
//! A missing file is not an error: the server starts with defaults and no
//! services.
//!
//! ```toml
//! [server]
//! port = 27000
//! check_for_disconnected_clients = true
//! show_stream_speed = true
//!
//! [[services]]
//! class = "HeartbeatService"
//! rate = 2.0
//!
//! [[services]]
//! class = "WandService"
//! ray_source_id = 1
//! controller_source_id = 0
//! ```
//!
//! Every key in a `[[services]]` table other than `class` and `name` is
//! handed to that service's `setup` untouched.
//!
//! Fields carry `#[serde(default = "...")]` so an older or partial file keeps
//! working as new settings are added.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Config path used when none is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "oinputserver.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Services to create, in order.
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// Network and main-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the handshake listener binds to.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,
    /// TCP port clients send their handshake to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a connection may take to deliver its handshake line.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Main tick period.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Ring buffer capacity.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Poll control sockets for closes and `data_off` every tick.
    #[serde(default = "default_true")]
    pub check_for_disconnected_clients: bool,
    /// Evict clients silent for this long.  0 disables idle eviction.
    #[serde(default)]
    pub client_idle_timeout_secs: u64,
    #[serde(default)]
    pub show_event_stream: bool,
    #[serde(default)]
    pub show_event_messages: bool,
    #[serde(default)]
    pub show_stream_speed: bool,
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// One `[[services]]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEntry {
    /// Registered service class, e.g. `"HeartbeatService"`.
    pub class: String,
    /// Instance name.  Defaults to the class name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Every other key in the table.
    #[serde(flatten)]
    pub settings: toml::Table,
}

impl ServiceEntry {
    pub fn instance_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.class)
    }
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// `None` when idle eviction is disabled.
    pub fn client_idle_timeout(&self) -> Option<Duration> {
        (self.client_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.client_idle_timeout_secs))
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_listen_ip() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_port() -> u16 {
    27000
}
fn default_handshake_timeout_ms() -> u64 {
    1000
}
fn default_tick_interval_ms() -> u64 {
    1
}
fn default_max_events() -> usize {
    oinput_core::DEFAULT_MAX_EVENTS
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            port: default_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            max_events: default_max_events(),
            check_for_disconnected_clients: default_true(),
            client_idle_timeout_secs: 0,
            show_event_stream: false,
            show_event_messages: false,
            show_stream_speed: false,
            log_level: default_log_level(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Parses and validates configuration text.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] for malformed TOML and
/// [`ConfigError::Invalid`] for out-of-range values.
pub fn parse_config(content: &str) -> Result<AppConfig, ConfigError> {
    let cfg: AppConfig = toml::from_str(content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Loads configuration from `path`, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] / [`ConfigError::Invalid`] for bad content.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_config(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn validate(cfg: &AppConfig) -> Result<(), ConfigError> {
    if cfg.server.max_events == 0 {
        return Err(ConfigError::Invalid {
            key: "server.max_events",
            reason: "must be at least 1".into(),
        });
    }
    if cfg.server.handshake_timeout_ms == 0 {
        return Err(ConfigError::Invalid {
            key: "server.handshake_timeout_ms",
            reason: "must be at least 1".into(),
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
