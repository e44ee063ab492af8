//! Daemon tunables.
//!
//! Resolution order: environment variables → settings file → defaults.
//!
//! Settings file location:
//!   1. $PIGGYBACK_HUB_SETTINGS (explicit override)
//!   2. <omd_root>/etc/check_mk/piggyback_hub.toml
//!
//! The file is optional. A file that exists but does not parse is an error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::settings_path;
use crate::retry::RetryPolicy;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    pub broker: BrokerSettings,
    pub queues: QueueSettings,
    pub retry: RetrySettings,
    pub watcher: WatcherSettings,
    pub supervisor: SupervisorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub host: String,
    /// TLS port. None = CONFIG_RABBITMQ_PORT from etc/omd/site.conf.
    pub port: Option<u16>,
    /// Application identity presented to the broker; also names our queues.
    pub app: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub payload_ttl_secs: Option<u64>,
    /// None = messages never expire.
    pub config_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub short_interval_secs: u64,
    pub short_attempts: u32,
    pub long_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    /// Safety rescan; new files are normally picked up through inotify.
    pub rescan_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// How long workers get to stop after SIGTERM before they are aborted.
    pub shutdown_grace_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_APP: &str = "piggyback-hub";

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            app: DEFAULT_APP.to_string(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            payload_ttl_secs: Some(600),
            config_ttl_secs: None,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            short_interval_secs: policy.short_interval.as_secs(),
            short_attempts: policy.short_attempts,
            long_interval_secs: policy.long_interval.as_secs(),
        }
    }
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            rescan_interval_ms: 60_000,
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: 5,
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            short_interval: Duration::from_secs(self.short_interval_secs),
            short_attempts: self.short_attempts,
            long_interval: Duration::from_secs(self.long_interval_secs),
        }
    }
}

impl QueueSettings {
    pub fn payload_ttl(&self) -> Option<Duration> {
        self.payload_ttl_secs.map(Duration::from_secs)
    }

    pub fn config_ttl(&self) -> Option<Duration> {
        self.config_ttl_secs.map(Duration::from_secs)
    }
}

impl WatcherSettings {
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_interval_ms.max(1))
    }
}

impl SupervisorSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl HubSettings {
    /// Load settings for the site at `root`: env vars → file → defaults.
    pub fn load(root: &Path) -> Result<Self, SettingsError> {
        let path = Self::file_path(root);
        let mut settings = Self::load_file(&path)?;
        settings.apply_overrides(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Settings file path.
    pub fn file_path(root: &Path) -> PathBuf {
        std::env::var("PIGGYBACK_HUB_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|_| settings_path(root))
    }

    fn load_file(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| SettingsError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| SettingsError::ParseFailed(path.to_path_buf(), e))
    }

    /// Apply PIGGYBACK_HUB_* overrides, looked up through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PIGGYBACK_HUB_BROKER__HOST") {
            self.broker.host = v;
        }
        if let Some(v) = lookup("PIGGYBACK_HUB_BROKER__PORT") {
            match v.parse() {
                Ok(port) => self.broker.port = Some(port),
                Err(_) => tracing::warn!(value = %v, "ignoring invalid PIGGYBACK_HUB_BROKER__PORT"),
            }
        }
    }
}
