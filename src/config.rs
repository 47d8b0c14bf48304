//! Configuration module for the molassh tarpit.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ADDR: &str = "127.0.0.1";
const DEFAULT_PORT: i64 = 2222;
const DEFAULT_DELAY_SECS: i64 = 10;
const DEFAULT_LINE_LENGTH: i64 = 32;

/// Shortest line the generator can produce: one printable byte plus CR LF.
pub const MIN_LINE_LENGTH: u8 = 3;

/// Command-line arguments for the tarpit
#[derive(Parser, Debug)]
#[command(name = "molassh")]
#[command(version = "0.1.0")]
#[command(about = "A slow fake SSH server that keeps attackers waiting", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 127.0.0.1)
    #[arg(short, long, env = "MOLASSH_ADDR")]
    pub addr: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "MOLASSH_PORT")]
    pub port: Option<i64>,

    /// Seconds to wait between writes on each connection
    #[arg(short, long, env = "MOLASSH_DELAY")]
    pub delay: Option<i64>,

    /// Maximum generated banner line length in bytes
    #[arg(long, env = "MOLASSH_LENGTH")]
    pub length: Option<i64>,

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
    pub tarpit: TarpitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            port: default_port(),
        }
    }
}

/// Stall-loop configuration
#[derive(Debug, Deserialize)]
pub struct TarpitConfig {
    /// Seconds to wait between writes on each connection
    #[serde(default = "default_delay")]
    pub delay: i64,
    /// Maximum generated banner line length in bytes
    #[serde(default = "default_length")]
    pub length: i64,
}

impl Default for TarpitConfig {
    fn default() -> Self {
        Self {
            delay: default_delay(),
            length: default_length(),
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

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_port() -> i64 {
    DEFAULT_PORT
}

fn default_delay() -> i64 {
    DEFAULT_DELAY_SECS
}

fn default_length() -> i64 {
    DEFAULT_LINE_LENGTH
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved and validated configuration.
///
/// The core only ever sees these values; all clamping happens in `resolve`.
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub port: u16,
    pub delay: Duration,
    pub max_line_length: u8,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::resolve(cli)
    }

    /// Merge CLI args with the TOML config and apply validation rules:
    /// negative port or delay fall back to their defaults, line length is
    /// clamped to `[3, 255]`.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let mut port = cli.port.unwrap_or(toml_config.server.port);
        if port < 0 {
            port = DEFAULT_PORT;
        }
        let port = u16::try_from(port).map_err(|_| ConfigError::PortOutOfRange(port))?;

        let mut delay = cli.delay.unwrap_or(toml_config.tarpit.delay);
        if delay < 0 {
            delay = DEFAULT_DELAY_SECS;
        }

        let length = cli
            .length
            .unwrap_or(toml_config.tarpit.length)
            .clamp(i64::from(MIN_LINE_LENGTH), 255) as u8;

        Ok(Config {
            addr: cli.addr.unwrap_or(toml_config.server.addr),
            port,
            delay: Duration::from_secs(delay as u64),
            max_line_length: length,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Address string suitable for `TcpListener::bind`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("port {0} is out of range")]
    PortOutOfRange(i64),
}
