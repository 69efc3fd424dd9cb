//! Configuration module for seesaw.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use crate::error::ConfigError;
use crate::runtime::Direction;
use crate::sequence::{DEFAULT_MAX_ROUND, MAX_ROUND_LIMIT};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "seesaw")]
#[command(version = "0.1.0")]
#[command(about = "Event-driven TCP exerciser trading growing integer rounds", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Largest round size in 32-bit words
    #[arg(short = 'm', long, global = true)]
    pub max_round: Option<usize>,

    /// Connect timeout in milliseconds
    #[arg(long, global = true)]
    pub connect_timeout_ms: Option<u64>,

    /// Accept timeout in milliseconds
    #[arg(long, global = true)]
    pub accept_timeout_ms: Option<u64>,

    /// Read timeout in milliseconds
    #[arg(long, global = true)]
    pub read_timeout_ms: Option<u64>,

    /// Write timeout in milliseconds
    #[arg(long, global = true)]
    pub write_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a server and read the first round
    Client {
        host: String,
        port: u16,

        /// Stop cleanly after this many rounds (0 = never)
        #[arg(short = 'n', long)]
        rounds: Option<u64>,
    },
    /// Accept connections and write the first round to each
    Server {
        port: u16,

        /// Address to bind to
        #[arg(short = 'b', long)]
        bind: Option<String>,

        /// Maximum number of simultaneous connections
        #[arg(long)]
        max_connections: Option<usize>,

        /// Listen backlog
        #[arg(long)]
        backlog: Option<i32>,
    },
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub rounds: RoundsConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Timeouts, in milliseconds
#[derive(Debug, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_timeout_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub accept_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub read_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub write_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_timeout_ms(),
            accept_ms: default_timeout_ms(),
            read_ms: default_timeout_ms(),
            write_ms: default_timeout_ms(),
        }
    }
}

/// Round sizing
#[derive(Debug, Deserialize)]
pub struct RoundsConfig {
    #[serde(default = "default_max_round")]
    pub max_round: usize,
    /// Client round limit (0 = unbounded)
    #[serde(default)]
    pub limit: u64,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            max_round: default_max_round(),
            limit: 0,
        }
    }
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
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

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_round() -> usize {
    DEFAULT_MAX_ROUND
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_connections() -> usize {
    10000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Independent timeouts for each kind of pending registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub accept: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Timeouts {
    /// Timeout for a round suspended in `direction`.
    pub fn for_direction(&self, direction: Direction) -> Duration {
        match direction {
            Direction::Read => self.read,
            Direction::Write => self.write,
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        let t = Duration::from_millis(default_timeout_ms());
        Self {
            connect: t,
            accept: t,
            read: t,
            write: t,
        }
    }
}

/// Which role to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Client { host: String, port: u16 },
    Server { port: u16 },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub timeouts: Timeouts,
    pub max_round: usize,
    /// Client only: close after this many rounds.
    pub rounds: Option<u64>,
    pub bind: String,
    pub backlog: i32,
    pub max_connections: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let ms = Duration::from_millis;
        let timeouts = Timeouts {
            connect: ms(cli.connect_timeout_ms.unwrap_or(toml_config.timeouts.connect_ms)),
            accept: ms(cli.accept_timeout_ms.unwrap_or(toml_config.timeouts.accept_ms)),
            read: ms(cli.read_timeout_ms.unwrap_or(toml_config.timeouts.read_ms)),
            write: ms(cli.write_timeout_ms.unwrap_or(toml_config.timeouts.write_ms)),
        };

        let mut config = Config {
            mode: Mode::Server { port: 0 },
            timeouts,
            max_round: cli.max_round.unwrap_or(toml_config.rounds.max_round),
            rounds: Some(toml_config.rounds.limit).filter(|&n| n > 0),
            bind: toml_config.server.bind,
            backlog: toml_config.server.backlog,
            max_connections: toml_config.server.max_connections,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        match cli.command {
            Command::Client { host, port, rounds } => {
                config.mode = Mode::Client { host, port };
                if let Some(rounds) = rounds {
                    config.rounds = Some(rounds).filter(|&n| n > 0);
                }
            }
            Command::Server {
                port,
                bind,
                max_connections,
                backlog,
            } => {
                config.mode = Mode::Server { port };
                config.bind = bind.unwrap_or(config.bind);
                config.max_connections = max_connections.unwrap_or(config.max_connections);
                config.backlog = backlog.unwrap_or(config.backlog);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_ROUND_LIMIT).contains(&self.max_round) {
            return Err(ConfigError::Invalid {
                field: "max_round",
                reason: format!("must be between 1 and {MAX_ROUND_LIMIT}"),
            });
        }
        let timeouts = [
            ("connect timeout", self.timeouts.connect),
            ("accept timeout", self.timeouts.accept),
            ("read timeout", self.timeouts.read),
            ("write timeout", self.timeouts.write),
        ];
        for (field, timeout) in timeouts {
            if timeout.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "max_connections",
                reason: "must be positive".to_string(),
            });
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid {
                field: "backlog",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Server { port: 0 },
            timeouts: Timeouts::default(),
            max_round: default_max_round(),
            rounds: None,
            bind: default_bind(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            log_level: default_log_level(),
        }
    }
}
