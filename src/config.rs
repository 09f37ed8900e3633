//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::logging::Severity;
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "polyglot-echo")]
#[command(version)]
#[command(about = "A concurrent TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Suppress informational logging
    #[arg(short, long)]
    pub quiet: bool,

    /// Path to the database (reserved, not opened)
    #[arg(short, long, value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Directory for stored files (reserved, not opened)
    #[arg(short, long, value_name = "PATH")]
    pub files: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to (defaults to all interfaces)
    #[arg(long)]
    pub host: Option<IpAddr>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Log level (debug, info, critical, none)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
        }
    }
}

/// Reserved storage locations
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
    #[serde(default = "default_files")]
    pub files: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            files: default_files(),
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

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8888
}

fn default_database() -> PathBuf {
    PathBuf::from("db.sqlite3")
}

fn default_files() -> PathBuf {
    PathBuf::from("files")
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Paths accepted for a future storage backend. Never opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    pub database: PathBuf,
    pub files: PathBuf,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            database: default_database(),
            files: default_files(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub workers: Option<usize>,
    pub log_level: Severity,
    pub storage: StoragePaths,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    ///
    /// Exits with status 2 on a malformed command line.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they name, if any.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.quiet {
            Severity::Critical
        } else {
            let level = cli.log_level.unwrap_or(toml_config.logging.level);
            level
                .parse()
                .map_err(ConfigError::InvalidLogLevel)?
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.or(toml_config.server.workers),
            log_level,
            storage: StoragePaths {
                database: cli.database.unwrap_or(toml_config.storage.database),
                files: cli.files.unwrap_or(toml_config.storage.files),
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidLogLevel(String),
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
            ConfigError::InvalidLogLevel(level) => write!(
                f,
                "Invalid log level '{}' (expected debug, info, critical or none)",
                level
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
