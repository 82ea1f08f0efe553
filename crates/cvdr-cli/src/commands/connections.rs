//! Connections command implementation

use anyhow::{Context, Result};

use cvdr_core::config::CvdrConfig;

use super::open_registry;
use crate::output::format_connections;

/// List known connections, dropping those whose agent has exited
pub fn connections_command(config: &CvdrConfig, host: Option<&str>) -> Result<()> {
    let registry = open_registry(config)?;

    let removed = registry
        .reconcile()
        .context("Failed to clean up stale connections")?;
    for record in &removed {
        tracing::info!("Removed stale connection {}", record.locator);
    }

    let records = match host {
        Some(host) => registry.list_by_host(host)?,
        None => registry.list_all()?,
    };

    println!("{}", format_connections(&records));
    Ok(())
}
