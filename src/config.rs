//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every key is optional; anything left out takes the
//! default below.
//!
//! ```toml
//! [connection]
//! host = "192.168.4.1"
//! reconnect_delay_ms = 3000
//! heartbeat_interval_ms = 30000
//! channel_capacity = 64
//!
//! [session]
//! open_commands = ["get_fs_info"]
//! enforce_capabilities = true
//!
//! [history]
//! export_path = ""
//!
//! [logging]
//! level = "info"
//! log_dir = ""
//! ```

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BmsLinkError, Result};
use crate::protocol::command::{Command, OutboundCommand};

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Device endpoint and connection timing
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Capacity of the transport and request channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Session behaviour
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Commands sent every time the connection opens
    #[serde(default = "default_open_commands")]
    pub open_commands: Vec<String>,

    #[serde(default = "default_enforce_capabilities")]
    pub enforce_capabilities: bool,
}

/// History export
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HistoryConfig {
    /// JSONL file written when the session ends; empty disables export
    #[serde(default)]
    pub export_path: String,
}

/// Log output
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for daily log files; empty logs to the console only
    #[serde(default)]
    pub log_dir: String,
}

// Default value functions
fn default_host() -> String { "192.168.4.1".to_string() }
fn default_reconnect_delay_ms() -> u64 { 3000 }
fn default_heartbeat_interval_ms() -> u64 { 30000 }
fn default_channel_capacity() -> usize { 64 }

fn default_open_commands() -> Vec<String> { vec!["get_fs_info".to_string()] }
fn default_enforce_capabilities() -> bool { true }

fn default_log_level() -> String { "info".to_string() }

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_commands: default_open_commands(),
            enforce_capabilities: default_enforce_capabilities(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: String::new(),
        }
    }
}

fn invalid(msg: impl std::fmt::Display) -> BmsLinkError {
    BmsLinkError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bms_link::config::Config;
    ///
    /// let config = Config::load("config/bms-link.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate configuration text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Commands to send on every connection open
    ///
    /// Names are checked by validation, so nothing is dropped here for a
    /// loaded configuration.
    pub fn open_commands(&self) -> Vec<OutboundCommand> {
        self.session
            .open_commands
            .iter()
            .filter_map(|name| name.parse::<Command>().ok())
            .map(OutboundCommand::new)
            .collect()
    }

    /// History export target, if enabled
    pub fn export_path(&self) -> Option<PathBuf> {
        let path = self.history.export_path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }

    /// Log directory, if file logging is enabled
    pub fn log_dir(&self) -> Option<PathBuf> {
        let dir = self.logging.log_dir.trim();
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.connection.host.trim().is_empty() {
            return Err(invalid("connection host cannot be empty"));
        }

        if self.connection.host.contains("://") {
            return Err(invalid("connection host must not include a scheme"));
        }

        if self.connection.reconnect_delay_ms == 0 || self.connection.reconnect_delay_ms > 60000 {
            return Err(invalid("reconnect_delay_ms must be between 1 and 60000"));
        }

        if self.connection.heartbeat_interval_ms == 0
            || self.connection.heartbeat_interval_ms > 600000
        {
            return Err(invalid("heartbeat_interval_ms must be between 1 and 600000"));
        }

        if self.connection.channel_capacity == 0 || self.connection.channel_capacity > 4096 {
            return Err(invalid("channel_capacity must be between 1 and 4096"));
        }

        for name in &self.session.open_commands {
            if name.parse::<Command>().is_err() {
                return Err(invalid(format!("open_commands: unknown command '{}'", name)));
            }
        }

        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(invalid(format!(
                "log level must be one of: {}",
                LOG_LEVELS.join(", ")
            )));
        }

        Ok(())
    }
}
