//! Configuration module for the framed-echo server and load client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line interface for framed-echo.
#[derive(Parser, Debug)]
#[command(name = "framed-echo")]
#[command(author = "framed-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A framed echo server and load client", long_about = None)]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Run the echo server
    Serve(ServeArgs),
    /// Run the load-generation client
    Load(LoadArgs),
}

/// Server arguments.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:15000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Per-connection buffer size in bytes (also the maximum frame payload)
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Maximum readiness events drained per poll wake
    #[arg(long)]
    pub max_events: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Discard bytes still buffered on a connection after each echo
    #[arg(long)]
    pub drain_after_echo: bool,
}

/// Load client arguments.
#[derive(Args, Debug)]
pub struct LoadArgs {
    /// Server address to connect to
    #[arg(short, long, default_value = "127.0.0.1:15000")]
    pub server: String,

    /// Number of concurrent connections
    #[arg(short, long, default_value_t = 100)]
    pub connections: usize,

    /// Messages sent per connection
    #[arg(short, long, default_value_t = 10)]
    pub messages: usize,

    /// Payload size of each message in bytes
    #[arg(long, default_value_t = 1024)]
    pub message_size: usize,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Server-related configuration.
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads (0 = number of CPU cores)
    #[serde(default)]
    pub workers: usize,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: 0,
            max_connections: default_max_connections(),
        }
    }
}

/// Reactor-related configuration.
#[derive(Debug, Deserialize)]
pub struct RuntimeSection {
    /// Per-connection buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Maximum readiness events drained per poll wake
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Discard bytes still buffered on a connection after each echo
    #[serde(default)]
    pub drain_after_echo: bool,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_events: default_max_events(),
            drain_after_echo: false,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:15000".to_string()
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_max_events() -> usize {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

/// Final resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub buffer_size: usize,
    pub max_events: usize,
    pub max_connections: usize,
    pub workers: usize,
    pub drain_after_echo: bool,
}

impl Config {
    /// Resolve the server configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(args: ServeArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = args.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            listen: args.listen.unwrap_or(toml_config.server.listen),
            buffer_size: args.buffer_size.unwrap_or(toml_config.runtime.buffer_size),
            max_events: args.max_events.unwrap_or(toml_config.runtime.max_events),
            max_connections: args
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            workers: args.workers.unwrap_or(toml_config.server.workers),
            drain_after_echo: args.drain_after_echo || toml_config.runtime.drain_after_echo,
        };

        if config.buffer_size == 0 {
            return Err(ConfigError::InvalidValue("buffer_size must be non-zero"));
        }
        if config.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be non-zero"));
        }
        if config.max_connections == 0 {
            return Err(ConfigError::InvalidValue(
                "max_connections must be non-zero",
            ));
        }

        Ok(config)
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidValue(&'static str),
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
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
