//! Configuration management for the termhub orchestrator.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termhub/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("connect_timeout_secs must be between 1 and 600, got {0}")]
    InvalidConnectTimeout(u64),

    #[error("keepalive_interval_secs must be between 1 and 3600, got {0}")]
    InvalidKeepaliveInterval(u64),

    #[error("op_timeout_secs must be between 1 and 3600, got {0}")]
    InvalidOpTimeout(u64),

    #[error("max_upload_size must be greater than 0, got {0}")]
    InvalidMaxUploadSize(u64),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termhub orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Local terminal configuration.
    pub terminal: TerminalConfig,

    /// Remote session configuration.
    pub remote: RemoteConfig,

    /// File sub-channel configuration.
    pub files: FileConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

/// Local terminal configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell command for new local sessions. Empty means auto-detect
    /// ($SHELL, then a platform default).
    pub shell: String,

    /// Command retried once when the preferred shell fails to spawn.
    pub fallback_shell: String,

    /// Value of $TERM inside spawned sessions.
    pub term: String,
}

/// Remote session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteConfig {
    /// Seconds to wait for a connection attempt before failing it.
    pub connect_timeout_secs: u64,

    /// Interval in seconds between keep-alive probes while connected.
    pub keepalive_interval_secs: u64,
}

/// File sub-channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    /// Seconds allowed for one listing or upload operation.
    pub op_timeout_secs: u64,

    /// Maximum upload size in bytes (default: 100MB).
    pub max_upload_size: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: String::new(),
            fallback_shell: default_fallback_shell().to_string(),
            term: "xterm-256color".to_string(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            keepalive_interval_secs: 10,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            op_timeout_secs: 30,
            max_upload_size: 100 * 1024 * 1024, // 100MB
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// The universal fallback shell for the platform.
pub fn default_fallback_shell() -> &'static str {
    if cfg!(windows) {
        "cmd.exe"
    } else {
        "/bin/sh"
    }
}

impl Config {
    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("termhub")
            .join("config.toml")
    }

    /// Loads configuration from the given path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from the default path, falling back to defaults
    /// when no file exists.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Saves the configuration to the given path, creating parent
    /// directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Applies environment variable overrides.
    ///
    /// `TERMHUB_LOG_LEVEL` overrides `log.level`; `TERMHUB_SHELL`
    /// overrides `terminal.shell`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMHUB_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(shell) = std::env::var("TERMHUB_SHELL") {
            self.terminal.shell = shell;
        }
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=600).contains(&self.remote.connect_timeout_secs) {
            return Err(ConfigError::InvalidConnectTimeout(
                self.remote.connect_timeout_secs,
            ));
        }
        if !(1..=3600).contains(&self.remote.keepalive_interval_secs) {
            return Err(ConfigError::InvalidKeepaliveInterval(
                self.remote.keepalive_interval_secs,
            ));
        }
        if !(1..=3600).contains(&self.files.op_timeout_secs) {
            return Err(ConfigError::InvalidOpTimeout(self.files.op_timeout_secs));
        }
        if self.files.max_upload_size == 0 {
            return Err(ConfigError::InvalidMaxUploadSize(
                self.files.max_upload_size,
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log.level.clone()));
        }
        Ok(())
    }

    /// The connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.remote.connect_timeout_secs)
    }

    /// The keep-alive probe interval as a `Duration`.
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.remote.keepalive_interval_secs)
    }

    /// The file-operation timeout as a `Duration`.
    pub fn file_op_timeout(&self) -> Duration {
        Duration::from_secs(self.files.op_timeout_secs)
    }
}
