//! Configuration: JSON file merged with command-line flags.
//!
//! Precedence, highest first: CLI flag, `transport_server.*`, the legacy
//! `manager.*` group, built-in default. The legacy group is kept for
//! existing deployments; `transport_server.*` wins field-by-field when
//! both are present. Unknown JSON keys are ignored.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use tracing::Level;

/// Default bind address for the manager.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
/// Default port on both sides.
pub const DEFAULT_PORT: u16 = 8080;
/// Allowed range for reactor worker threads.
pub const IO_THREADS_RANGE: std::ops::RangeInclusive<usize> = 1..=512;

/// Errors produced while loading or validating configuration. Fatal at
/// startup; the binaries exit with code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The config file is not valid JSON.
    #[error("cannot parse config file {}: {source}", path.display())]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },
    /// A recognized option has an out-of-range or malformed value.
    #[error("invalid value for {option}: {reason}")]
    InvalidValue {
        /// The offending option, dotted-path style.
        option: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

/// `transport_server.*` options.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TransportServerSection {
    /// Bind address.
    pub listen_host: Option<String>,
    /// Bind port.
    pub listen_port: Option<u16>,
    /// Reactor worker threads.
    pub io_threads: Option<usize>,
    /// Protocol body-size cap in bytes.
    pub max_body_size: Option<u32>,
}

/// Legacy `manager.*` options; `transport_server.*` wins when present.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LegacyManagerSection {
    /// Bind address fallback.
    pub listen_host: Option<String>,
    /// Bind port fallback.
    pub listen_port: Option<u16>,
}

/// `worker.*` options.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    /// Manager address to connect to.
    pub manager_host: Option<String>,
    /// Manager port to connect to.
    pub manager_port: Option<u16>,
    /// `blocking` or `async`.
    pub mode: Option<String>,
    /// Consecutive failed connects tolerated before giving up.
    pub connect_attempts: Option<u32>,
    /// Delay between connect attempts, in milliseconds.
    pub connect_backoff_ms: Option<u64>,
}

/// `network.*` options.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Overlay identity directory.
    pub identity_path: Option<PathBuf>,
}

/// `logging.*` options.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: Option<String>,
}

/// The raw JSON configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// `transport_server.*` group.
    pub transport_server: TransportServerSection,
    /// Legacy `manager.*` group.
    pub manager: LegacyManagerSection,
    /// `worker.*` group.
    pub worker: WorkerSection,
    /// `network.*` group.
    pub network: NetworkSection,
    /// `logging.*` group.
    pub logging: LoggingSection,
}

impl FileConfig {
    /// Load from a JSON file; `None` yields the empty configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Which strategy the worker runtime uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerMode {
    /// Run the task loop on a dedicated thread.
    #[default]
    Blocking,
    /// Run the task loop as a reactor coroutine.
    Async,
}

impl FromStr for WorkerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocking" => Ok(Self::Blocking),
            "async" => Ok(Self::Async),
            other => Err(format!("expected \"blocking\" or \"async\", got \"{other}\"")),
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking => write!(f, "blocking"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// Command-line flags for the manager binary. Flags beat the config file.
#[derive(Debug, Default, Parser)]
#[command(name = "manager", about = "Task Messenger manager", version)]
pub struct ManagerArgs {
    /// Path to a JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Bind address.
    #[arg(long)]
    pub listen_host: Option<String>,
    /// Bind port.
    #[arg(long)]
    pub listen_port: Option<u16>,
    /// Reactor worker threads (1..=512).
    #[arg(long)]
    pub io_threads: Option<usize>,
    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    pub log_level: Option<String>,
    /// Overlay identity directory.
    #[arg(long)]
    pub identity_path: Option<PathBuf>,
    /// Enqueue this many demo reverse-skill tasks at startup.
    #[arg(long)]
    pub demo_tasks: Option<u32>,
}

/// Command-line flags for the worker binary. Flags beat the config file.
#[derive(Debug, Default, Parser)]
#[command(name = "worker", about = "Task Messenger worker", version)]
pub struct WorkerArgs {
    /// Path to a JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Manager address.
    #[arg(long)]
    pub manager_host: Option<String>,
    /// Manager port.
    #[arg(long)]
    pub manager_port: Option<u16>,
    /// Runtime strategy: blocking or async.
    #[arg(long)]
    pub mode: Option<String>,
    /// Consecutive failed connects tolerated before exiting.
    #[arg(long)]
    pub connect_attempts: Option<u32>,
    /// Delay between connect attempts, in milliseconds.
    #[arg(long)]
    pub connect_backoff_ms: Option<u64>,
    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    pub log_level: Option<String>,
    /// Overlay identity directory.
    #[arg(long)]
    pub identity_path: Option<PathBuf>,
}

/// Fully resolved manager configuration.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Bind address.
    pub listen_host: String,
    /// Bind port.
    pub listen_port: u16,
    /// Reactor worker threads.
    pub io_threads: usize,
    /// Protocol body-size cap in bytes.
    pub max_body_size: u32,
    /// Overlay identity directory, if configured.
    pub identity_path: Option<PathBuf>,
    /// Log level for the subscriber.
    pub log_level: Level,
    /// Demo tasks enqueued at startup.
    pub demo_tasks: u32,
}

/// Fully resolved worker configuration.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Manager address.
    pub manager_host: String,
    /// Manager port.
    pub manager_port: u16,
    /// Runtime strategy.
    pub mode: WorkerMode,
    /// Consecutive failed connects tolerated before exiting.
    pub connect_attempts: u32,
    /// Delay between connect attempts.
    pub connect_backoff: Duration,
    /// Overlay identity directory, if configured.
    pub identity_path: Option<PathBuf>,
    /// Log level for the subscriber.
    pub log_level: Level,
}

fn parse_level(value: Option<String>) -> Result<Level, ConfigError> {
    let Some(value) = value else {
        return Ok(Level::INFO);
    };
    Level::from_str(&value).map_err(|_| ConfigError::InvalidValue {
        option: "logging.level",
        reason: format!("expected trace..error, got \"{value}\""),
    })
}

/// Merge file and flags into the manager's effective configuration.
pub fn resolve_manager(file: FileConfig, args: &ManagerArgs) -> Result<ManagerConfig, ConfigError> {
    let listen_host = args
        .listen_host
        .clone()
        .or(file.transport_server.listen_host)
        .or(file.manager.listen_host)
        .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string());
    let listen_port = args
        .listen_port
        .or(file.transport_server.listen_port)
        .or(file.manager.listen_port)
        .unwrap_or(DEFAULT_PORT);
    let io_threads = args
        .io_threads
        .or(file.transport_server.io_threads)
        .unwrap_or(1);
    if !IO_THREADS_RANGE.contains(&io_threads) {
        return Err(ConfigError::InvalidValue {
            option: "transport_server.io_threads",
            reason: format!("{io_threads} is outside 1..=512"),
        });
    }
    let max_body_size = file
        .transport_server
        .max_body_size
        .unwrap_or(task_messenger_net::DEFAULT_MAX_BODY_SIZE);
    if max_body_size == 0 {
        return Err(ConfigError::InvalidValue {
            option: "transport_server.max_body_size",
            reason: "must be nonzero".to_string(),
        });
    }
    Ok(ManagerConfig {
        listen_host,
        listen_port,
        io_threads,
        max_body_size,
        identity_path: args.identity_path.clone().or(file.network.identity_path),
        log_level: parse_level(args.log_level.clone().or(file.logging.level))?,
        demo_tasks: args.demo_tasks.unwrap_or(0),
    })
}

/// Merge file and flags into the worker's effective configuration.
pub fn resolve_worker(file: FileConfig, args: &WorkerArgs) -> Result<WorkerConfig, ConfigError> {
    let manager_host = args
        .manager_host
        .clone()
        .or(file.worker.manager_host)
        .unwrap_or_else(|| "localhost".to_string());
    let manager_port = args
        .manager_port
        .or(file.worker.manager_port)
        .unwrap_or(DEFAULT_PORT);
    let mode = match args.mode.clone().or(file.worker.mode) {
        Some(value) => value
            .parse::<WorkerMode>()
            .map_err(|reason| ConfigError::InvalidValue {
                option: "worker.mode",
                reason,
            })?,
        None => WorkerMode::default(),
    };
    let connect_attempts = args
        .connect_attempts
        .or(file.worker.connect_attempts)
        .unwrap_or(10);
    if connect_attempts == 0 {
        return Err(ConfigError::InvalidValue {
            option: "worker.connect_attempts",
            reason: "must be at least 1".to_string(),
        });
    }
    let connect_backoff_ms = args
        .connect_backoff_ms
        .or(file.worker.connect_backoff_ms)
        .unwrap_or(500);
    Ok(WorkerConfig {
        manager_host,
        manager_port,
        mode,
        connect_attempts,
        connect_backoff: Duration::from_millis(connect_backoff_ms),
        identity_path: args.identity_path.clone().or(file.network.identity_path),
        log_level: parse_level(args.log_level.clone().or(file.logging.level))?,
    })
}
