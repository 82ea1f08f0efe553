//! cvdr-core: Core types, configuration and connection registry for cvdr
//!
//! This crate provides the device locator and connection record model, the
//! error taxonomy, configuration loading, the on-disk connection registry and
//! the collaborator traits used by the agent, orchestrator and CLI crates.

pub mod config;
pub mod error;
pub mod process;
pub mod registry;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{AggregatedError, ConfigError, CvdrError, DeviceFailure, StorageError, TunnelError};
pub use registry::Registry;
pub use types::{AgentKind, ConnectionRecord, DeviceLocator, IceConfig, ProxyAddress, Reachability};

/// Status report types, re-exported for convenience
pub use cvdr_protocol::{ConnectionStatus, ControlState};
