//! Configuration module for the kecho daemon.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo daemon
#[derive(Parser, Debug, Default)]
#[command(name = "kecho")]
#[command(author = "kecho authors")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent TCP echo daemon", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:12345)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Number of worker threads in the connection pool
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of outstanding connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Per-connection buffer size in bytes (at least 2)
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Number of connection buffers (defaults to max connections)
    #[arg(long)]
    pub buffer_pool: Option<usize>,

    /// Buffer acquisition attempts before a connection is rejected
    #[arg(long)]
    pub alloc_retries: Option<u32>,

    /// Initial backoff between buffer acquisition attempts, in milliseconds
    #[arg(long)]
    pub alloc_backoff_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Registry capacity
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Connection buffer configuration
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    /// Size of each connection buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub size: usize,
    /// Number of buffers shared by all connections (defaults to max_connections)
    pub pool: Option<usize>,
    /// Attempts to acquire a buffer before the connection is rejected
    #[serde(default = "default_alloc_retries")]
    pub alloc_retries: u32,
    /// Initial backoff between attempts, doubled on every retry
    #[serde(default = "default_alloc_backoff_ms")]
    pub alloc_backoff_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size: default_buffer_size(),
            pool: None,
            alloc_retries: default_alloc_retries(),
            alloc_backoff_ms: default_alloc_backoff_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
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

fn default_listen() -> String {
    "127.0.0.1:12345".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    4096
}

fn default_alloc_retries() -> u32 {
    16
}

fn default_alloc_backoff_ms() -> u64 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Smallest usable connection buffer: one byte to receive, one in reserve.
pub const MIN_BUFFER_SIZE: usize = 2;

/// Upper bound for a single allocation backoff sleep.
pub const MAX_ALLOC_BACKOFF: Duration = Duration::from_millis(100);

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub buffer_size: usize,
    pub buffer_pool: usize,
    pub alloc_retries: u32,
    pub alloc_backoff: Duration,
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

        // Load TOML config if specified
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

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(ConfigError::Invalid(format!(
                "buffer size must be at least {MIN_BUFFER_SIZE} bytes, got {}",
                self.buffer_size
            )));
        }
        Ok(())
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);

        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections,
            buffer_size: cli.buffer_size.unwrap_or(toml_config.buffer.size),
            buffer_pool: cli
                .buffer_pool
                .or(toml_config.buffer.pool)
                .unwrap_or(max_connections),
            alloc_retries: cli
                .alloc_retries
                .unwrap_or(toml_config.buffer.alloc_retries),
            alloc_backoff: Duration::from_millis(
                cli.alloc_backoff_ms
                    .unwrap_or(toml_config.buffer.alloc_backoff_ms),
            ),
            log_level: if !cli.log_level.is_empty() && cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    /// Size of the connection worker pool.
    pub fn worker_count(&self) -> usize {
        match self.workers {
            Some(0) | None => num_cpus() * 4,
            Some(n) => n,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:12345");
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.buffer.size, 4096);
        assert_eq!(config.buffer.pool, None);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:7"
            workers = 8
            max_connections = 64

            [buffer]
            size = 8192
            pool = 32
            alloc_retries = 3
            alloc_backoff_ms = 5

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:7");
        assert_eq!(config.server.workers, Some(8));
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.buffer.size, 8192);
        assert_eq!(config.buffer.pool, Some(32));
        assert_eq!(config.buffer.alloc_retries, 3);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:7"
            max_connections = 64

            [logging]
            level = "warn"
        "#,
        )
        .unwrap();
        let cli = CliArgs {
            listen: Some("127.0.0.1:9000".to_string()),
            buffer_size: Some(512),
            log_level: "info".to_string(),
            ..Default::default()
        };

        let config = Config::merge(cli, file);
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.max_connections, 64);
        // Pool follows the registry capacity unless set explicitly
        assert_eq!(config.buffer_pool, 64);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_cli_buffer_policy_flags() {
        let file: TomlConfig = toml::from_str(
            r#"
            [buffer]
            pool = 32
            alloc_retries = 3
            alloc_backoff_ms = 5
        "#,
        )
        .unwrap();
        let cli = CliArgs {
            buffer_pool: Some(8),
            alloc_retries: Some(0),
            ..Default::default()
        };

        let config = Config::merge(cli, file);
        assert_eq!(config.buffer_pool, 8);
        assert_eq!(config.alloc_retries, 0);
        assert_eq!(config.alloc_backoff, Duration::from_millis(5));
    }

    #[test]
    fn test_validate_buffer_size() {
        assert!(Config::default().validate().is_ok());

        for size in [0, 1] {
            let config = Config {
                buffer_size: size,
                ..Config::default()
            };
            let err = config.validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)));
        }

        let config = Config {
            buffer_size: MIN_BUFFER_SIZE,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_count() {
        let mut config = Config::default();
        config.workers = Some(3);
        assert_eq!(config.worker_count(), 3);

        config.workers = None;
        assert!(config.worker_count() >= 4);
    }
}
