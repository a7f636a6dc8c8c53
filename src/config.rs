//! Configuration module for netsum.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::packet::HASH_LENGTH;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "netsum")]
#[command(author = "netsum authors")]
#[command(version = "0.1.0")]
#[command(about = "TCP throughput and correctness exerciser", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Seconds between throughput reports
    #[arg(long, global = true)]
    pub report_interval: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Which endpoint to run
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send packets to a server and verify the echoed reversal
    #[command(disable_help_flag = true)]
    Client(ClientArgs),
    /// Accept connections and echo reversed packets
    Server(ServerArgs),
}

/// Client options
#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server host name or address
    #[arg(short = 'h', long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of concurrent connections
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Packet size in bytes
    #[arg(short, long)]
    pub size: Option<usize>,

    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    pub help: Option<bool>,
}

/// Server options
#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Largest frame payload accepted, in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Maximum concurrently handled connections (unbounded if unset)
    #[arg(long)]
    pub max_connections: Option<usize>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub throughput: ThroughputSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Client-related configuration
#[derive(Debug, Deserialize, Default)]
pub struct ClientSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub threads: Option<usize>,
    pub packet_size: Option<usize>,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub max_frame_size: Option<usize>,
    pub max_connections: Option<usize>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: None,
            max_frame_size: None,
            max_connections: None,
            backlog: default_backlog(),
        }
    }
}

/// Throughput reporting configuration
#[derive(Debug, Deserialize)]
pub struct ThroughputSection {
    /// Seconds between reports
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
}

impl Default for ThroughputSection {
    fn default() -> Self {
        Self {
            report_interval: default_report_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_threads() -> usize {
    1
}

fn default_packet_size() -> usize {
    100_000
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_backlog() -> i32 {
    1024
}

fn default_report_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub threads: usize,
    pub packet_size: usize,
    pub report_interval: Duration,
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_frame_size: usize,
    pub max_connections: Option<usize>,
    pub backlog: i32,
    pub report_interval: Duration,
}

/// Endpoint-specific settings
#[derive(Debug, Clone)]
pub enum Mode {
    Client(ClientConfig),
    Server(ServerConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let report_interval = Duration::from_secs(
            cli.report_interval
                .unwrap_or(file.throughput.report_interval),
        );
        if report_interval.is_zero() {
            return Err(ConfigError::Invalid("report interval must be positive".into()));
        }

        let mode = match cli.command {
            Command::Client(args) => Mode::Client(resolve_client(args, file.client, report_interval)?),
            Command::Server(args) => Mode::Server(resolve_server(args, file.server, report_interval)?),
        };

        Ok(Config {
            mode,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        })
    }
}

fn resolve_client(
    args: ClientArgs,
    file: ClientSection,
    report_interval: Duration,
) -> Result<ClientConfig, ConfigError> {
    let config = ClientConfig {
        host: args
            .host
            .or(file.host)
            .ok_or(ConfigError::Missing("client host"))?,
        port: args
            .port
            .or(file.port)
            .ok_or(ConfigError::Missing("client port"))?,
        threads: args.threads.or(file.threads).unwrap_or_else(default_threads),
        packet_size: args
            .size
            .or(file.packet_size)
            .unwrap_or_else(default_packet_size),
        report_interval,
    };

    if config.threads == 0 {
        return Err(ConfigError::Invalid(format!(
            "No threads: {}",
            config.threads
        )));
    }
    if config.packet_size < HASH_LENGTH || i32::try_from(config.packet_size).is_err() {
        return Err(ConfigError::Invalid(format!(
            "Rogue packet size: {}",
            config.packet_size
        )));
    }
    Ok(config)
}

fn resolve_server(
    args: ServerArgs,
    file: ServerSection,
    report_interval: Duration,
) -> Result<ServerConfig, ConfigError> {
    let config = ServerConfig {
        port: args
            .port
            .or(file.port)
            .ok_or(ConfigError::Missing("server port"))?,
        max_frame_size: args
            .max_frame_size
            .or(file.max_frame_size)
            .unwrap_or_else(default_max_frame_size),
        max_connections: args.max_connections.or(file.max_connections),
        backlog: file.backlog,
        report_interval,
    };

    if config.max_frame_size < HASH_LENGTH {
        return Err(ConfigError::Invalid(format!(
            "max frame size {} cannot hold a packet",
            config.max_frame_size
        )));
    }
    if config.max_connections == Some(0) {
        return Err(ConfigError::Invalid("max connections must be positive".into()));
    }
    Ok(config)
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, toml::de::Error),
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
