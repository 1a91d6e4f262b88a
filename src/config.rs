//! Configuration module for the thermolink server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the ingestion server
#[derive(Parser, Debug)]
#[command(name = "thermolink")]
#[command(author = "thermolink authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP ingestion server for temperature/humidity sensors", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0:8888)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Ingestion queue capacity in readings
    #[arg(short = 'q', long)]
    pub queue_capacity: Option<usize>,

    /// Consumer drain period in milliseconds
    #[arg(short = 'd', long)]
    pub drain_interval: Option<u64>,

    /// Number of recent records handed to the display layer
    #[arg(short = 'r', long)]
    pub recent_limit: Option<usize>,

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
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Ingestion-related configuration
#[derive(Debug, Deserialize)]
pub struct IngestConfig {
    /// Queue capacity in readings
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Consumer drain period in milliseconds
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// Number of recent records handed to the display layer
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drain_interval_ms: default_drain_interval_ms(),
            recent_limit: default_recent_limit(),
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

fn default_queue_capacity() -> usize {
    1024
}

fn default_drain_interval_ms() -> u64 {
    2000
}

fn default_recent_limit() -> usize {
    20
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub queue_capacity: usize,
    pub drain_interval_ms: u64,
    pub recent_limit: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    /// Merge CLI args with the TOML config they reference.
    fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            queue_capacity: cli
                .queue_capacity
                .unwrap_or(toml_config.ingest.queue_capacity),
            drain_interval_ms: cli
                .drain_interval
                .unwrap_or(toml_config.ingest.drain_interval_ms),
            recent_limit: cli.recent_limit.unwrap_or(toml_config.ingest.recent_limit),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
