//! Configuration loading for the sync client.
//!
//! Endpoints, timeouts and the credentials path are required. The tuning
//! sections may be omitted and then take the values the web client ships
//! with.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::socketio::TransportKind;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShipConfig {
    /// REST root, including the `/api` suffix.
    pub api_base_url: String,
    /// Event-stream host; the Socket.IO path is appended.
    pub socket_url: String,
    pub request_timeout_ms: u64,
    pub credentials_path: PathBuf,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub transports: TransportConfig,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before giving up.
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransportConfig {
    pub order: Vec<TransportKind>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            order: vec![TransportKind::Websocket, TransportKind::Polling],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PrefetchConfig {
    pub enabled: bool,
    pub feed_stale_ms: u64,
    pub leaderboard_stale_ms: u64,
    pub intros_stale_ms: u64,
    pub conversations_stale_ms: u64,
    pub leaderboard_limit: u32,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_stale_ms: 15 * 60 * 1000,
            leaderboard_stale_ms: 15 * 60 * 1000,
            intros_stale_ms: 2 * 60 * 1000,
            conversations_stale_ms: 30 * 1000,
            leaderboard_limit: 50,
        }
    }
}

impl PrefetchConfig {
    pub fn feed_stale(&self) -> Duration {
        Duration::from_millis(self.feed_stale_ms)
    }

    pub fn leaderboard_stale(&self) -> Duration {
        Duration::from_millis(self.leaderboard_stale_ms)
    }

    pub fn intros_stale(&self) -> Duration {
        Duration::from_millis(self.intros_stale_ms)
    }

    pub fn conversations_stale(&self) -> Duration {
        Duration::from_millis(self.conversations_stale_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSettings {
    pub default_stale_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_stale_ms: 30 * 1000,
        }
    }
}

impl CacheSettings {
    pub fn default_stale(&self) -> Duration {
        Duration::from_millis(self.default_stale_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NotificationConfig {
    pub capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or SHIP_SYNC_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ShipConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ShipConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let api = self.api_base_url.trim();
        if api.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !(api.starts_with("http://") || api.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "api_base_url",
                reason: "must be an http(s) URL".to_string(),
            });
        }
        if self.socket_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "socket_url",
                reason: "must not be empty".to_string(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.credentials_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "credentials_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.reconnect.attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "reconnect.attempts",
                reason: "must be > 0".to_string(),
            });
        }
        if self.transports.order.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "transports.order",
                reason: "must list at least one transport".to_string(),
            });
        }
        let mut seen = Vec::with_capacity(self.transports.order.len());
        for transport in &self.transports.order {
            if seen.contains(transport) {
                return Err(ConfigError::InvalidValue {
                    field: "transports.order",
                    reason: format!("{} listed twice", transport),
                });
            }
            seen.push(*transport);
        }
        if self.prefetch.leaderboard_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "prefetch.leaderboard_limit",
                reason: "must be > 0".to_string(),
            });
        }
        if self.notifications.capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "notifications.capacity",
                reason: "must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("SHIP_SYNC_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
