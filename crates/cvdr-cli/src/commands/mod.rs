//! CLI command implementations

mod config;
mod connect;
mod connections;
mod disconnect;

use std::sync::Arc;

use anyhow::{Context, Result};

use cvdr_core::config::CvdrConfig;
use cvdr_core::traits::DebugBridge;
use cvdr_core::{CvdrError, Registry};
use cvdr_orchestrator::{AgentLauncher, ConnectSettings, Connector};

use crate::bridge::{AdbBridge, NoopBridge};
use crate::directory::HttpDeviceDirectory;

pub use config::{config_get, config_path, config_show};
pub use connect::{connect_command, ConnectOptions};
pub use connections::connections_command;
pub use disconnect::disconnect_command;

/// Open the connection registry under the configured control directory
pub fn open_registry(config: &CvdrConfig) -> Result<Registry> {
    let dir = config.control_dir();
    Registry::open(&dir).with_context(|| format!("Failed to open connection registry at {:?}", dir))
}

fn debug_bridge(config: &CvdrConfig, no_adb: bool) -> Arc<dyn DebugBridge> {
    if no_adb {
        Arc::new(NoopBridge)
    } else {
        Arc::new(AdbBridge::new(config.adb_path.clone()))
    }
}

fn build_connector(
    config: &CvdrConfig,
    launcher: Arc<dyn AgentLauncher>,
    no_adb: bool,
) -> Result<Connector> {
    let registry = open_registry(config)?;
    let proxy = config.proxy_address().map_err(CvdrError::from)?;
    let directory = HttpDeviceDirectory::new(proxy.as_ref())?;
    let settings = ConnectSettings::from_config(config).map_err(CvdrError::from)?;
    Ok(Connector::new(
        registry,
        Arc::new(directory),
        debug_bridge(config, no_adb),
        launcher,
        settings,
    ))
}
