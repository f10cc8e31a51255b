//! Configuration module for the echo-mux server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "echo-mux")]
#[command(version)]
#[command(about = "A single-threaded TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (0 lets the OS pick one)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen backlog depth
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Poll timeout in milliseconds; bounds how long shutdown can go unnoticed
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Maximum readiness events handled per poll
    #[arg(long)]
    pub events_capacity: Option<usize>,

    /// Bytes requested per recv call
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// Close connections idle for this many seconds
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and connection configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle timeout in seconds; absent means connections never time out
    pub idle_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            idle_timeout_secs: None,
        }
    }
}

/// Event loop tuning
#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            events_capacity: default_events_capacity(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    100
}

fn default_events_capacity() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub events_capacity: usize,
    pub read_buffer_size: usize,
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over file values.
    fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            backlog: cli.backlog.unwrap_or(file.server.backlog),
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms.unwrap_or(file.runtime.poll_timeout_ms),
            ),
            events_capacity: cli.events_capacity.unwrap_or(file.runtime.events_capacity),
            read_buffer_size: cli.read_buffer_size.unwrap_or(file.runtime.read_buffer_size),
            idle_timeout: cli
                .idle_timeout_secs
                .or(file.server.idle_timeout_secs)
                .map(Duration::from_secs),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }

    /// Reject values the event loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll_timeout_ms must be at least 1"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid("events_capacity must be at least 1"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("idle_timeout_secs must be at least 1"));
        }
        self.listen_addr().map(|_| ())
    }

    /// Resolve `host:port` to the first matching socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(ConfigError::Address(raw))
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Address(String),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Address(addr) => write!(f, "Invalid listen address '{addr}'"),
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead(_, e) => Some(e),
            ConfigError::TomlParse(_, e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 7878);
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.runtime.poll_timeout_ms, 100);
        assert!(config.server.idle_timeout_secs.is_none());
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 9000
            max_connections = 64
            idle_timeout_secs = 30

            [runtime]
            events_capacity = 256

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.idle_timeout_secs, Some(30));
        assert_eq!(config.runtime.events_capacity, 256);
        assert_eq!(config.runtime.read_buffer_size, 16 * 1024);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 9000
            backlog = 16

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let cli = CliArgs {
            port: Some(0),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };

        let config = Config::merge(cli, file);
        assert_eq!(config.port, 0);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.events_capacity = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.read_buffer_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.idle_timeout = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // A zero poll timeout would spin the loop.
        let mut config = Config::default();
        config.poll_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_listen_addr() {
        let mut config = Config::default();
        config.port = 0;
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.port(), 0);
        assert!(addr.ip().is_loopback());

        config.host = "not a host name".to_string();
        assert!(matches!(config.listen_addr(), Err(ConfigError::Address(_))));
    }
}
