//! Disconnect command implementation

use std::sync::Arc;

use anyhow::Result;

use cvdr_core::config::CvdrConfig;
use cvdr_core::{ConfigError, CvdrError};
use cvdr_orchestrator::{DisconnectTarget, Fleet, InProcessLauncher};

use super::build_connector;
use crate::output::{print_success, print_warning};

/// Execute the disconnect command
///
/// With a host and device ids only those devices are disconnected, with a
/// host alone every connection of that host, with neither every connection.
pub async fn disconnect_command(
    config: &CvdrConfig,
    host: Option<String>,
    devices: Vec<String>,
    no_adb: bool,
) -> Result<()> {
    let target = match (host, devices.is_empty()) {
        (Some(host), false) => DisconnectTarget::Devices {
            service_endpoint: config.service_endpoint(),
            host,
            ids: devices,
        },
        (Some(host), true) => DisconnectTarget::Host(host),
        (None, true) => DisconnectTarget::All,
        (None, false) => {
            return Err(CvdrError::from(ConfigError::MissingField("host for devices".into())).into())
        }
    };

    // Nothing is launched while disconnecting
    let fleet = Fleet::new(build_connector(
        config,
        Arc::new(InProcessLauncher::new()),
        no_adb,
    )?);

    let report = fleet.disconnect_many(target).await?;
    for (locator, success) in report.successes() {
        print_success(&format!("Disconnected {}", locator));
        if let Some(warning) = &success.warning {
            print_warning(&format!("{}: {}", locator, warning));
        }
    }

    report.into_result().map_err(CvdrError::from)?;
    Ok(())
}
