//! Configuration resolution for tether.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/tether/settings.json)
//! 3. Explicit config file (when given)
//! 4. Environment variables (highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Name of the named-stream channel type opened for in-process streams.
pub const DEFAULT_STREAM_CHANNEL_NAME: &str = "custom-inproc-stream";

/// Complete tether configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection actor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Dial attempts per connect or reconnect sequence.
    pub reconnect_attempts: u32,
    /// Fixed pause between failed dial attempts (milliseconds).
    pub reconnect_pause_ms: u64,
    /// Reconnect notifications arriving sooner than this after the last
    /// successful connect are ignored (milliseconds).
    pub reconnect_debounce_ms: u64,
    /// Idle timeout applied to every new channel (seconds, 0 = disabled).
    pub channel_idle_timeout_secs: u64,
    /// Channel type requested for named logical streams.
    pub stream_channel_name: String,
    /// Capacity of the actor's request mailbox.
    pub mailbox_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 10,
            reconnect_pause_ms: 1000,
            reconnect_debounce_ms: 1000,
            channel_idle_timeout_secs: 0,
            stream_channel_name: DEFAULT_STREAM_CHANNEL_NAME.to_string(),
            mailbox_capacity: 64,
        }
    }
}

impl ConnectionConfig {
    pub const fn reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.reconnect_pause_ms)
    }

    pub const fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    /// Idle timeout for new channels, `None` when disabled.
    pub const fn channel_idle_timeout(&self) -> Option<Duration> {
        if self.channel_idle_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.channel_idle_timeout_secs))
        }
    }

    /// Reject settings the connection actor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.reconnect_attempts == 0 {
            return Err(Error::Config(
                "reconnect_attempts must be at least 1".to_string(),
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err(Error::Config(
                "mailbox_capacity must be at least 1".to_string(),
            ));
        }
        if self.stream_channel_name.trim().is_empty() {
            return Err(Error::Config(
                "stream_channel_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `RUST_LOG`-style filter.
    pub filter: String,
    /// Emit JSON log lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "tether_core=info,tether_client=info".to_string(),
            json: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        config = load_config_file(&global_path)?;
    }

    if let Some(path) = explicit {
        config = load_config_file(path)?;
    }

    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".tether").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/tether/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("tether").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Read one JSON settings file. Missing sections fall back to defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(n) = env_parse("TETHER_RECONNECT_ATTEMPTS") {
        config.connection.reconnect_attempts = n;
    }
    if let Some(n) = env_parse("TETHER_RECONNECT_PAUSE_MS") {
        config.connection.reconnect_pause_ms = n;
    }
    if let Some(n) = env_parse("TETHER_RECONNECT_DEBOUNCE_MS") {
        config.connection.reconnect_debounce_ms = n;
    }
    if let Some(n) = env_parse("TETHER_IDLE_TIMEOUT_SECS") {
        config.connection.channel_idle_timeout_secs = n;
    }
    if let Ok(val) = std::env::var("TETHER_LOG") {
        config.logging.filter = val;
    }
    if let Some(json) = env_parse("TETHER_LOG_JSON") {
        config.logging.json = json;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.parse().ok())
}
