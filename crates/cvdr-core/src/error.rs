//! Core error types for cvdr

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::DeviceLocator;

/// Top-level error type for connection management
#[derive(Error, Debug)]
pub enum CvdrError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The agent exited or closed its output before reporting a status
    #[error("No response from agent for {locator}{}", describe_exit(.exit))]
    AgentUnresponsive {
        locator: DeviceLocator,
        exit: Option<i32>,
    },

    /// The agent's first output line was not a status report
    #[error("Failed to decode agent output for {locator} ({raw:?}): {source}")]
    MalformedAgentOutput {
        locator: DeviceLocator,
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    /// The agent process could not be started
    #[error("Failed to launch agent: {0}")]
    AgentLaunch(#[source] std::io::Error),

    /// The agent process could not be signalled to stop
    #[error("Failed to stop agent (pid {pid}): {source}")]
    AgentStop {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    /// Connection registry error
    #[error("Registry error: {0}")]
    Storage(#[from] StorageError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Orchestration service lookup failed
    #[error("Device directory error: {0}")]
    Directory(String),

    /// Local debug bridge failed
    #[error("Debug bridge error: {0}")]
    Bridge(String),

    /// No connection exists for the locator
    #[error("Connection not found for \"{0}\"")]
    NotFound(DeviceLocator),

    /// Nothing matched a disconnect request
    #[error("No connections found")]
    NoConnections,

    /// Several devices failed independently
    #[error("{0}")]
    Aggregated(#[from] AggregatedError),

    /// A per-device task ended without producing a result
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CvdrError {
    /// Whether this error came from the configuration layer
    pub fn is_config(&self) -> bool {
        matches!(self, CvdrError::Config(_))
    }
}

fn describe_exit(exit: &Option<i32>) -> String {
    match exit {
        Some(code) => format!(" (agent exited with status {})", code),
        None => String::new(),
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Proxy address is not a usable SOCKS5 URL
    #[error("Invalid proxy URL {url:?}: {reason}")]
    InvalidProxy { url: String, reason: String },

    /// ICE configuration file could not be used
    #[error("Invalid ICE config {path:?}: {reason}")]
    IceConfig { path: PathBuf, reason: String },
}

/// Connection registry errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem error on a registry path
    #[error("{op} {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record file exists but cannot be parsed
    #[error("Corrupt connection record {path:?}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A record could not be serialized
    #[error("Failed to serialize connection record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Some stale log files could not be deleted
    #[error("Removed {removed} old log files, failed to remove {}: {}", .failures.len(), .failures.join("; "))]
    LogPrune {
        removed: usize,
        failures: Vec<String>,
    },
}

impl StorageError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by a tunnel engine
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Could not reach the remote debug port
    #[error("Failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Could not bind the local endpoint
    #[error("Failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// SOCKS5 negotiation failed
    #[error("SOCKS5 proxy error: {0}")]
    Socks(String),

    /// Signaling exchange or data channel failed
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// No free loopback port in the scanned range
    #[error("No free control port at or above {0}")]
    NoFreePort(u16),

    /// I/O error while pumping bytes
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One device's failure inside a fan-out operation
#[derive(Debug)]
pub struct DeviceFailure {
    pub locator: DeviceLocator,
    pub cause: CvdrError,
}

/// Every failure of a fan-out operation, in request order
#[derive(Debug, Default)]
pub struct AggregatedError {
    pub failures: Vec<DeviceFailure>,
}

impl AggregatedError {
    /// Number of failed devices
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no device failed
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregatedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} device(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.locator, failure.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregatedError {}
