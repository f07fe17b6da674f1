//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.hublink/config.json`) and environment.
//! The connection section mirrors what a hub needs to reach its realtime server.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::transport::EnvelopeLayout;

/// Top-level client config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Realtime server connection settings.
    #[serde(default)]
    pub connection: ConnectionSetting,
}

/// How to reach the realtime server and keep the connection healthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSetting {
    /// Socket url of the realtime server, e.g. `wss://example.com/gaming`.
    #[serde(default)]
    pub url: String,

    /// Read buffer for inbound frames (default 4 KB). Pick it from the largest message the app exchanges.
    #[serde(default = "default_in_buffer_size")]
    pub in_buffer_size: usize,

    /// When true, hubs attached through the same manager share one connector (default true).
    #[serde(default = "default_true")]
    pub use_default_connector: bool,

    /// Sent as the `Authorization` header on connect, e.g. "Bearer your_access_token".
    /// Overridden by HUBLINK_AUTHORIZATION env.
    #[serde(default)]
    pub authorization: Option<String>,

    /// Ping the server periodically to measure round-trip time (default true).
    #[serde(default = "default_true")]
    pub allow_ping_server: bool,

    /// Ping period in milliseconds (default 5000).
    #[serde(default = "default_ping_interval_millis")]
    pub ping_interval_millis: u64,

    /// Pings without a pong for this long are forgotten (default 30000).
    #[serde(default = "default_ping_timeout_millis")]
    pub ping_timeout_millis: u64,

    /// Envelopes carry a terminal id after the hub id (several terminals per hub type).
    #[serde(default)]
    pub multi_terminal: bool,
}

fn default_in_buffer_size() -> usize {
    1 << 12
}

fn default_true() -> bool {
    true
}

fn default_ping_interval_millis() -> u64 {
    5000
}

fn default_ping_timeout_millis() -> u64 {
    30_000
}

impl Default for ConnectionSetting {
    fn default() -> Self {
        Self {
            url: String::new(),
            in_buffer_size: default_in_buffer_size(),
            use_default_connector: true,
            authorization: None,
            allow_ping_server: true,
            ping_interval_millis: default_ping_interval_millis(),
            ping_timeout_millis: default_ping_timeout_millis(),
            multi_terminal: false,
        }
    }
}

impl ConnectionSetting {
    /// Setting for `url` with every other field at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_millis.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_millis)
    }

    pub fn layout(&self) -> EnvelopeLayout {
        if self.multi_terminal {
            EnvelopeLayout::MultiTerminal
        } else {
            EnvelopeLayout::Single
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the authorization header: env HUBLINK_AUTHORIZATION overrides config.
pub fn resolve_authorization(setting: &ConnectionSetting) -> Option<String> {
    non_empty_env("HUBLINK_AUTHORIZATION").or_else(|| {
        setting
            .authorization
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the server url: env HUBLINK_URL overrides config.
pub fn resolve_url(setting: &ConnectionSetting) -> Option<String> {
    non_empty_env("HUBLINK_URL").or_else(|| {
        let u = setting.url.trim();
        if u.is_empty() {
            None
        } else {
            Some(u.to_string())
        }
    })
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("HUBLINK_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".hublink").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default path). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(ClientConfig, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        ClientConfig::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
