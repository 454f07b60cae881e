//! Command-line plumbing shared by `shm_producer` and `shm_consumer`.

#![deny(missing_docs)]

use clap::Args;
use shm_channel::config::{ChannelSettings, LoggingConfig};
use shm_channel::{Backend, Channel, ChannelConfig, ConfigError, ConfigLoader, LogLevel};
use std::path::PathBuf;

/// Element type, capacity and slot count both drivers agree on
pub type DemoQueue = Channel<u32, 1024, 1>;

/// Channel used when neither the command line nor a config file names one
pub const DEFAULT_CHANNEL: &str = "/tmp/shared_queue_file";

/// Options common to both drivers; command-line values win over the file.
#[derive(Args, Debug, Clone)]
pub struct ChannelArgs {
    /// Channel name (also the sentinel file path)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Shared memory backend: posix or xsi
    #[arg(short, long)]
    pub backend: Option<Backend>,

    /// TOML configuration file with [channel] and [logging] tables
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Block on the slot 0 condition variable instead of polling
    #[arg(long)]
    pub blocking: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    pub json: bool,
}

impl ChannelArgs {
    /// Merge the optional config file with command-line overrides
    pub fn resolve(&self) -> Result<ChannelConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => {
                let config = ChannelConfig::load(path)?;
                config.validate()?;
                config
            }
            None => ChannelConfig {
                channel: ChannelSettings {
                    name: DEFAULT_CHANNEL.to_string(),
                    backend: Backend::default(),
                    clean: false,
                },
                logging: LoggingConfig::default(),
            },
        };

        if let Some(name) = &self.name {
            config.channel.name = name.clone();
        }
        if let Some(backend) = self.backend {
            config.channel.backend = backend;
        }
        if self.verbose {
            config.logging.log_level = LogLevel::Debug;
        }
        config.validate()?;
        Ok(config)
    }

    /// Resolve the configuration and install logging before returning, so a
    /// configuration error can still be reported through `tracing`.
    ///
    /// Without a usable configuration the subscriber falls back to `info`
    /// (`debug` with `--verbose`).
    pub fn init(&self) -> Result<ChannelConfig, ConfigError> {
        let resolved = self.resolve();
        let level = match &resolved {
            Ok(config) => config.logging.log_level,
            Err(_) if self.verbose => LogLevel::Debug,
            Err(_) => LogLevel::default(),
        };
        shm_channel::init_tracing(level, self.json);
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        channel: ChannelArgs,
    }

    #[test]
    fn test_defaults_without_config() {
        let cli = Cli::parse_from(["demo"]);
        let config = cli.channel.resolve().unwrap();
        assert_eq!(config.channel.name, DEFAULT_CHANNEL);
        assert_eq!(config.channel.backend, Backend::Posix);
        assert_eq!(config.logging.log_level, LogLevel::Info);
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.toml");
        std::fs::write(
            &path,
            "[channel]\nname = \"/tmp/from_file\"\nbackend = \"posix\"\nclean = true\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "demo",
            "--config",
            path.to_str().unwrap(),
            "--backend",
            "xsi",
            "-v",
        ]);
        let config = cli.channel.resolve().unwrap();
        assert_eq!(config.channel.name, "/tmp/from_file");
        assert_eq!(config.channel.backend, Backend::Xsi);
        assert!(config.channel.clean);
        assert_eq!(config.logging.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_missing_config_file() {
        let cli = Cli::parse_from(["demo", "--config", "/nonexistent/channel.toml"]);
        assert!(matches!(cli.channel.resolve(), Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_init_reports_errors_after_logging_is_up() {
        let cli = Cli::parse_from(["demo", "--config", "/nonexistent/channel.toml"]);
        assert!(matches!(cli.channel.init(), Err(ConfigError::FileNotFound)));
        assert!(!shm_channel::init_tracing(LogLevel::Info, false));

        let cli = Cli::parse_from(["demo", "--name", "/tmp/initialized"]);
        assert_eq!(cli.channel.init().unwrap().channel.name, "/tmp/initialized");
    }
}
