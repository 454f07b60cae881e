//! Channel configuration loaded from TOML files.
//!
//! # TOML Example
//!
//! ```toml
//! [channel]
//! name = "/tmp/shared_queue_file"
//! backend = "xsi"
//! clean = true
//!
//! [logging]
//! log_level = "debug"
//! ```
//!
//! Any deserializable type can be loaded through [`ConfigLoader`]:
//!
//! ```rust,no_run
//! use shm_channel::config::{ChannelConfig, ConfigError, ConfigLoader};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = ChannelConfig::load(Path::new("channel.toml"))?;
//!     config.validate()?;
//!     println!("Channel: {}", config.channel.name);
//!     Ok(())
//! }
//! ```

use crate::area::Backend;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log verbosity, lowercase in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Development detail, including attach/detach and region init.
    Debug,
    /// Channel creation and removal.
    #[default]
    Info,
    /// Swallowed teardown failures.
    Warn,
    /// Fatal errors only.
    Error,
}

impl LogLevel {
    /// Matching `tracing` level
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// `[channel]` table: which channel to open and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Channel name; doubles as the sentinel file path.
    pub name: String,

    /// OS shared memory family.
    #[serde(default)]
    pub backend: Backend,

    /// Remove stale sentinel markers before creating.
    #[serde(default)]
    pub clean: bool,
}

/// `[logging]` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Complete channel configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel selection.
    pub channel: ChannelSettings,

    /// Logging options.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ChannelConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `channel.name` is empty
    /// - `channel.name` contains a NUL byte
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "channel.name cannot be empty".to_string(),
            ));
        }
        if self.channel.name.contains('\0') {
            return Err(ConfigError::ValidationError(
                "channel.name cannot contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from TOML files.
///
/// Implemented for every `serde::de::DeserializeOwned` type.
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if reading fails or TOML is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
