//! Hidden agent sub-commands
//!
//! `cvdr proxy_agent` and `cvdr signaling_agent` are started by `cvdr
//! connect`, never by hand. An agent prints one status line on stdout once
//! its tunnel is up, closes its standard streams and keeps serving in the
//! background. Errors before that point go to stderr with a non-zero exit
//! status; everything afterwards goes to the agent's log file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cvdr_agent::daemon::shutdown_on_signals;
use cvdr_agent::{
    ChannelTransport, EngineOptions, Negotiating, ProxyTransport, ReportChannel,
    WebSocketSignaling,
};
use cvdr_core::config::DEFAULT_BASE_CONTROL_PORT;
use cvdr_core::traits::DeviceDirectory;
use cvdr_core::{AgentKind, CvdrError, DeviceLocator, IceConfig, ProxyAddress};

use crate::directory::HttpDeviceDirectory;

/// Arguments shared by both agent sub-commands
#[derive(Debug, Clone, Args)]
pub struct AgentArgs {
    /// Device id on the host
    pub device: String,

    /// Host running the device
    #[arg(long)]
    pub host: String,

    /// Orchestration service API root
    #[arg(long)]
    pub service_url: String,

    /// File receiving the agent's logs
    #[arg(long)]
    pub log_file: PathBuf,

    /// Control socket path
    #[arg(long)]
    pub control_socket: PathBuf,

    /// First loopback port to try for the control endpoint
    #[arg(long, default_value_t = DEFAULT_BASE_CONTROL_PORT)]
    pub base_port: u16,

    /// SOCKS5 proxy (`socks5://host:port`)
    #[arg(long)]
    pub proxy: Option<String>,

    /// ICE servers file (signaling agent)
    #[arg(long)]
    pub ice_config: Option<PathBuf>,

    /// Device debug address (`host:port`); looked up when omitted
    #[arg(long)]
    pub target: Option<String>,
}

impl AgentArgs {
    pub fn locator(&self) -> DeviceLocator {
        DeviceLocator::new(&self.service_url, &self.host, &self.device)
    }
}

/// Send all logs to `path`, creating its directory if needed
pub fn init_file_logging(path: &Path, level: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {:?}", parent))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false),
        )
        .init();
    Ok(())
}

/// Run an agent until its tunnel ends
///
/// Returns an error only if the tunnel never came up.
pub async fn run_agent(kind: AgentKind, args: AgentArgs) -> Result<()> {
    let locator = args.locator();
    locator.validate().map_err(CvdrError::from)?;
    tracing::info!("{} agent starting for {}", kind, locator);

    let proxy = args
        .proxy
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(ProxyAddress::parse)
        .transpose()
        .map_err(CvdrError::from)?;

    // Handlers go in before the report so an early SIGTERM is not lost
    let shutdown = shutdown_on_signals().context("Failed to install signal handlers")?;

    let options = EngineOptions::new(&args.control_socket).with_base_port(args.base_port);
    let negotiating = Negotiating::new(locator.clone(), options, ReportChannel::Stdio);

    let running = match kind {
        AgentKind::Proxy => {
            let target = match args.target.clone() {
                Some(target) => target,
                None => {
                    let directory = HttpDeviceDirectory::new(proxy.as_ref())?;
                    directory.debug_endpoint(&locator).await?
                }
            };
            let transport = ProxyTransport::new(&target, proxy).map_err(CvdrError::from)?;
            negotiating.establish(transport).await
        }
        AgentKind::Signaling => {
            let ice = args
                .ice_config
                .as_deref()
                .map(IceConfig::load)
                .transpose()
                .map_err(CvdrError::from)?;
            let signaling =
                WebSocketSignaling::new(&locator, ice.as_ref()).map_err(CvdrError::from)?;
            negotiating.establish(ChannelTransport::new(signaling)).await
        }
    };

    let running = match running {
        Ok(running) => running,
        Err(e) => {
            tracing::error!("Failed to establish tunnel for {}: {}", locator, e);
            return Err(CvdrError::from(e))
                .with_context(|| format!("Failed to connect to {}", locator));
        }
    };

    // Detached from here on: failures only reach the log file
    if let Err(e) = running.run(shutdown).await {
        tracing::error!("Tunnel for {} failed: {}", locator, e);
    }
    tracing::info!("{} agent for {} exiting", kind, locator);
    Ok(())
}
