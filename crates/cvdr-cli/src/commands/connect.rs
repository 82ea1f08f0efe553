//! Connect command implementation

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use cvdr_agent::daemon::shutdown_on_signals;
use cvdr_core::config::CvdrConfig;
use cvdr_core::{AgentKind, ConfigError, CvdrError, DeviceLocator};
use cvdr_orchestrator::{AgentLauncher, Fleet, InProcessLauncher, SubprocessLauncher};

use super::build_connector;
use crate::output::{print_info, print_warning};

/// Options of `cvdr connect`
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub host: Option<String>,
    pub devices: Vec<String>,
    /// Keep tunnels in this process instead of background agents
    pub foreground: bool,
    pub no_adb: bool,
    pub agent: Option<AgentKind>,
}

/// Execute the connect command
///
/// Prints `host/device: 127.0.0.1:<port>` for every device that connected,
/// in the order the devices were given.
pub async fn connect_command(config: &CvdrConfig, options: ConnectOptions) -> Result<()> {
    let host = options
        .host
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CvdrError::from(ConfigError::MissingField("host for devices".into())))?;

    let endpoint = config.service_endpoint();
    let locators: Vec<DeviceLocator> = options
        .devices
        .iter()
        .map(|id| DeviceLocator::new(endpoint.clone(), host.clone(), id.clone()))
        .collect();

    let launcher: Arc<dyn AgentLauncher> = if options.foreground {
        Arc::new(InProcessLauncher::new())
    } else {
        Arc::new(SubprocessLauncher::current_exe()?)
    };
    let fleet = Fleet::new(build_connector(config, launcher, options.no_adb)?);
    let preference = options.agent.or(config.connect_agent);

    let report = fleet
        .connect_many(locators, preference, |locator, success| {
            println!("{}: {}", locator, success.status);
            if let Some(warning) = &success.warning {
                print_warning(&format!("{}: {}", locator, warning));
            }
        })
        .await;

    if options.foreground && fleet.in_process_count() > 0 {
        let shutdown: CancellationToken =
            shutdown_on_signals().context("Failed to install signal handlers")?;
        print_info("Tunnels are running in the foreground. Press Ctrl+C to disconnect.");

        let stopped = fleet.wait_in_process(shutdown).await;
        for failure in stopped.failures() {
            print_warning(&format!("{}: {}", failure.locator, failure.cause));
        }
    }

    report.into_result().map_err(CvdrError::from)?;
    Ok(())
}
