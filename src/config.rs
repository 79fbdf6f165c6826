//! Server Configuration
//!
//! Everything is decided once at startup from the command line (or the
//! matching `HSHA_ECHO_*` environment variables) and never changes while the
//! server runs.
//!
//! ```text
//! hsha-echo [PORT] [--mode hsha|reactor] [--workers N]
//!           [--max-queued-tasks N] [--max-queued-bytes N]
//!           [--max-connection-bytes N] [--max-line-length N]
//!           [--idle-timeout SECS] [--host HOST]
//! ```

use crate::executor::task::checked_estimated_size;
use crate::protocol::MAX_LINE_LENGTH;
use clap::{Parser, ValueEnum};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default port when none is given on the command line
pub const DEFAULT_PORT: u16 = 8080;

/// Default bind host (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default number of pool workers
pub const DEFAULT_WORKERS: usize = 8;

/// Default ceiling on outstanding pool tasks
pub const DEFAULT_MAX_QUEUED_TASKS: usize = 65_536;

/// Default ceiling on the estimated bytes held by outstanding tasks
pub const DEFAULT_MAX_QUEUED_BYTES: usize = 1_000_000;

/// Default ceiling on the estimated bytes held by one connection's tasks
pub const DEFAULT_MAX_CONNECTION_BYTES: usize = 1_000_000;

/// Which execution model serves the connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Handlers run inline on the connection's I/O task
    Reactor,
    /// Handlers run on the ordered, bounded worker pool
    Hsha,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Reactor => f.write_str("reactor"),
            Mode::Hsha => f.write_str("hsha"),
        }
    }
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "hsha-echo")]
#[command(version)]
#[command(about = "Line-delimited TCP echo server (reactor or half-sync/half-async)", long_about = None)]
pub struct Cli {
    /// Port to listen on
    #[arg(default_value_t = DEFAULT_PORT, env = "HSHA_ECHO_PORT")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, default_value = DEFAULT_HOST, env = "HSHA_ECHO_HOST")]
    pub host: String,

    /// Execution model
    #[arg(long, value_enum, default_value_t = Mode::Hsha, env = "HSHA_ECHO_MODE")]
    pub mode: Mode,

    /// Number of worker threads (hsha mode)
    #[arg(short, long, default_value_t = DEFAULT_WORKERS, env = "HSHA_ECHO_WORKERS")]
    pub workers: usize,

    /// Maximum number of outstanding tasks in the pool (hsha mode)
    #[arg(long, default_value_t = DEFAULT_MAX_QUEUED_TASKS, env = "HSHA_ECHO_MAX_QUEUED_TASKS")]
    pub max_queued_tasks: usize,

    /// Maximum estimated bytes held by outstanding tasks (hsha mode)
    #[arg(long, default_value_t = DEFAULT_MAX_QUEUED_BYTES, env = "HSHA_ECHO_MAX_QUEUED_BYTES")]
    pub max_queued_bytes: usize,

    /// Maximum estimated bytes held by one connection's tasks (hsha mode)
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTION_BYTES, env = "HSHA_ECHO_MAX_CONNECTION_BYTES")]
    pub max_connection_bytes: usize,

    /// Longest accepted line in bytes
    #[arg(long, default_value_t = MAX_LINE_LENGTH, env = "HSHA_ECHO_MAX_LINE_LENGTH")]
    pub max_line_length: usize,

    /// Close connections idle for this many seconds
    #[arg(long, value_name = "SECS", env = "HSHA_ECHO_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,
}

/// Worker pool sizing and admission bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Number of worker threads
    pub workers: usize,
    /// Ceiling on outstanding (queued or executing) tasks
    pub max_queued_tasks: usize,
    /// Ceiling on the estimated bytes of all outstanding tasks
    pub max_queued_bytes: usize,
    /// Ceiling on the estimated bytes of one connection's outstanding tasks
    pub max_connection_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_queued_tasks: DEFAULT_MAX_QUEUED_TASKS,
            max_queued_bytes: DEFAULT_MAX_QUEUED_BYTES,
            max_connection_bytes: DEFAULT_MAX_CONNECTION_BYTES,
        }
    }
}

impl ExecutorConfig {
    /// Checks the bounds a pool needs to make progress at all.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_queued_tasks == 0 {
            return Err(ConfigError::NoTaskCapacity);
        }
        Ok(())
    }

    /// Checks that a task carrying a line of `max_line_length` bytes fits
    /// under both byte ceilings, so no valid line can be refused forever.
    pub fn validate_for_line_length(&self, max_line_length: usize) -> Result<(), ConfigError> {
        self.validate()?;

        let required = checked_estimated_size(max_line_length)
            .ok_or(ConfigError::LineLengthTooLarge(max_line_length))?;
        for (name, ceiling) in [
            ("max_queued_bytes", self.max_queued_bytes),
            ("max_connection_bytes", self.max_connection_bytes),
        ] {
            if ceiling < required {
                return Err(ConfigError::ByteCeilingTooSmall {
                    name,
                    ceiling,
                    required,
                });
            }
        }
        Ok(())
    }
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Execution model
    pub mode: Mode,
    /// Longest accepted line
    pub max_line_length: usize,
    /// Idle connections are closed after this long
    pub idle_timeout: Option<Duration>,
    /// Pool settings, used in hsha mode only
    pub executor: ExecutorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            mode: Mode::Hsha,
            max_line_length: MAX_LINE_LENGTH,
            idle_timeout: None,
            executor: ExecutorConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_line_length == 0 {
            return Err(ConfigError::ZeroLineLength);
        }
        if self.mode == Mode::Hsha {
            self.executor.validate_for_line_length(self.max_line_length)?;
        }
        Ok(())
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let config = ServerConfig {
            host: cli.host,
            port: cli.port,
            mode: cli.mode,
            max_line_length: cli.max_line_length,
            idle_timeout: cli
                .idle_timeout
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            executor: ExecutorConfig {
                workers: cli.workers,
                max_queued_tasks: cli.max_queued_tasks,
                max_queued_bytes: cli.max_queued_bytes,
                max_connection_bytes: cli.max_connection_bytes,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("the worker pool needs at least one worker")]
    NoWorkers,

    #[error("max_queued_tasks must be at least 1")]
    NoTaskCapacity,

    #[error("max_line_length must be at least 1")]
    ZeroLineLength,

    #[error("max_line_length {0} is too large to account for")]
    LineLengthTooLarge(usize),

    #[error("{name} is {ceiling} bytes but a maximal line needs {required}")]
    ByteCeilingTooSmall {
        name: &'static str,
        ceiling: usize,
        required: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ServerConfig, ConfigError> {
        let mut argv = vec!["hsha-echo"];
        argv.extend_from_slice(args);
        ServerConfig::try_from(Cli::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.mode, Mode::Hsha);
        assert_eq!(config.max_line_length, 8192);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.executor, ExecutorConfig::default());
        assert_eq!(config.executor.workers, 8);
    }

    #[test]
    fn test_positional_port() {
        let config = parse(&["9000"]).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_port_is_rejected() {
        assert!(Cli::try_parse_from(["hsha-echo", "not-a-port"]).is_err());
        assert!(Cli::try_parse_from(["hsha-echo", "70000"]).is_err());
    }

    #[test]
    fn test_options() {
        let config = parse(&[
            "7000",
            "--mode",
            "reactor",
            "--workers",
            "2",
            "--max-queued-tasks",
            "16",
            "--idle-timeout",
            "30",
        ])
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.mode, Mode::Reactor);
        assert_eq!(config.executor.workers, 2);
        assert_eq!(config.executor.max_queued_tasks, 16);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert_eq!(parse(&["--workers", "0"]).unwrap_err(), ConfigError::NoWorkers);
    }

    #[test]
    fn test_reactor_mode_ignores_pool_bounds() {
        assert!(parse(&["--mode", "reactor", "--workers", "0"]).is_ok());
    }

    #[test]
    fn test_byte_ceiling_must_fit_a_line() {
        let err = parse(&["--max-queued-bytes", "100"]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ByteCeilingTooSmall {
                name: "max_queued_bytes",
                ceiling: 100,
                ..
            }
        ));
    }

    #[test]
    fn test_huge_line_length_rejected() {
        let max = usize::MAX.to_string();
        assert_eq!(
            parse(&["--max-line-length", &max]).unwrap_err(),
            ConfigError::LineLengthTooLarge(usize::MAX)
        );
    }

    #[test]
    fn test_zero_line_length_rejected() {
        assert_eq!(
            parse(&["--max-line-length", "0"]).unwrap_err(),
            ConfigError::ZeroLineLength
        );
    }
}
