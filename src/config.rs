//! Configuration module for the echo integrity server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::StackOptions;
use crate::session::{SessionOptions, IDLE_TICKS, TEST_ITERATIONS};
use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the test server
#[derive(Parser, Debug)]
#[command(name = "echo-integrity")]
#[command(author = "echo-integrity authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo data-integrity test server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0:4242)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Verified round trips required to pass
    #[arg(short = 'n', long)]
    pub iterations: Option<u32>,

    /// Fixed seed for the payload generator
    #[arg(long)]
    pub seed: Option<u64>,

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
    pub test: TestConfig,
    #[serde(default)]
    pub stack: StackConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub link: LinkConfig,
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

/// Test session configuration
#[derive(Debug, Deserialize)]
pub struct TestConfig {
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    pub seed: Option<u64>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            seed: None,
        }
    }
}

/// Network stack tunables
#[derive(Debug, Deserialize)]
pub struct StackConfig {
    /// Coarse timer tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Idle cadence in ticks
    #[serde(default = "default_idle_ticks")]
    pub idle_ticks: u32,
    /// Per-connection outbound buffer in bytes
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    /// Receive window in bytes
    #[serde(default = "default_recv_window")]
    pub recv_window: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            idle_ticks: default_idle_ticks(),
            send_buffer: default_send_buffer(),
            recv_window: default_recv_window(),
        }
    }
}

/// Outer driver loop configuration
#[derive(Debug, Deserialize)]
pub struct DriverConfig {
    #[serde(default = "default_loop_period_ms")]
    pub loop_period_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            loop_period_ms: default_loop_period_ms(),
        }
    }
}

/// Link association configuration
#[derive(Debug, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_link_retries")]
    pub retries: u32,
    #[serde(default = "default_link_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            retries: default_link_retries(),
            timeout_ms: default_link_timeout_ms(),
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
    "0.0.0.0:4242".to_string()
}

fn default_iterations() -> u32 {
    TEST_ITERATIONS
}

fn default_tick_ms() -> u64 {
    500
}

fn default_idle_ticks() -> u32 {
    IDLE_TICKS
}

fn default_send_buffer() -> usize {
    8192
}

fn default_recv_window() -> usize {
    4096
}

fn default_loop_period_ms() -> u64 {
    100
}

fn default_link_retries() -> u32 {
    10
}

fn default_link_timeout_ms() -> u64 {
    3333
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub iterations: u32,
    pub seed: Option<u64>,
    pub tick_ms: u64,
    pub idle_ticks: u32,
    pub send_buffer: usize,
    pub recv_window: usize,
    pub loop_period_ms: u64,
    pub link_retries: u32,
    pub link_timeout_ms: u64,
    pub log_level: String,
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

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen))?;

        Ok(Config {
            listen,
            iterations: cli.iterations.unwrap_or(toml_config.test.iterations).max(1),
            seed: cli.seed.or(toml_config.test.seed),
            tick_ms: toml_config.stack.tick_ms,
            idle_ticks: toml_config.stack.idle_ticks,
            send_buffer: toml_config.stack.send_buffer,
            recv_window: toml_config.stack.recv_window,
            loop_period_ms: toml_config.driver.loop_period_ms,
            link_retries: toml_config.link.retries,
            link_timeout_ms: toml_config.link.timeout_ms,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            iterations: self.iterations,
            idle_ticks: self.idle_ticks,
            seed: self.seed,
        }
    }

    pub fn stack_options(&self) -> StackOptions {
        StackOptions::from(self)
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_millis(self.loop_period_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
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
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{addr}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
