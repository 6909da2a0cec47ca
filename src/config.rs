//! Configuration module for the admitd server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "admitd")]
#[command(author = "admitd authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-protocol server with bounded admission", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8888)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrently served connections
    #[arg(short = 'n', long)]
    pub max_clients: Option<usize>,

    /// Maximum time a connection may wait for a slot, in milliseconds
    #[arg(short = 'w', long)]
    pub wait_timeout_ms: Option<u64>,

    /// Upper bound between waiting-queue re-checks, in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// Simulated processing latency per session, in milliseconds
    #[arg(short = 'd', long)]
    pub processing_delay_ms: Option<u64>,

    /// Let new arrivals take a free slot even while others are waiting
    #[arg(long)]
    pub no_strict_fifo: bool,

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
    pub admission: AdmissionSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Listen backlog passed to the socket
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
        }
    }
}

/// Admission-related configuration
#[derive(Debug, Deserialize)]
pub struct AdmissionSection {
    /// Concurrent session limit
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Longest a queued connection may wait, in milliseconds
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Upper bound between queue re-checks, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Newcomers queue behind existing waiters
    #[serde(default = "default_strict_fifo")]
    pub strict_fifo: bool,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            wait_timeout_ms: default_wait_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            strict_fifo: default_strict_fifo(),
        }
    }
}

/// Session-related configuration
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    /// Simulated processing latency, in milliseconds
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            processing_delay_ms: default_processing_delay_ms(),
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
    "0.0.0.0:8888".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_clients() -> usize {
    2
}

fn default_wait_timeout_ms() -> u64 {
    6_000 // 6 seconds
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_strict_fifo() -> bool {
    true
}

fn default_processing_delay_ms() -> u64 {
    20_000 // 20 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Options consumed by the admission controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Concurrency cap for the worker pool.
    pub max_clients: usize,
    /// Longest a connection may sit in the waiting queue.
    pub wait_timeout: Duration,
    /// Upper bound on how long the dispatcher sleeps between re-checks.
    pub poll_interval: Duration,
    /// When set, a new arrival is only admitted directly if nobody is waiting.
    pub strict_fifo: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_clients: default_max_clients(),
            wait_timeout: Duration::from_millis(default_wait_timeout_ms()),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            strict_fifo: default_strict_fifo(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: i32,
    pub admission: AdmissionConfig,
    pub processing_delay: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve CLI args against the optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_str.clone()))?;

        let admission = AdmissionConfig {
            max_clients: cli
                .max_clients
                .unwrap_or(toml_config.admission.max_clients),
            wait_timeout: Duration::from_millis(
                cli.wait_timeout_ms
                    .unwrap_or(toml_config.admission.wait_timeout_ms),
            ),
            poll_interval: Duration::from_millis(
                cli.poll_interval_ms
                    .unwrap_or(toml_config.admission.poll_interval_ms),
            ),
            strict_fifo: toml_config.admission.strict_fifo && !cli.no_strict_fifo,
        };

        let config = Config {
            listen,
            backlog: toml_config.server.backlog,
            admission,
            processing_delay: Duration::from_millis(
                cli.processing_delay_ms
                    .unwrap_or(toml_config.session.processing_delay_ms),
            ),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.max_clients == 0 {
            return Err(ConfigError::Invalid("max_clients must be at least 1"));
        }
        if self.admission.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("poll_interval_ms must be non-zero"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive"));
        }
        Ok(())
    }
}
