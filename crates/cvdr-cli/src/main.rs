//! cvdr CLI
//!
//! Single binary for all cvdr operations:
//! - Management commands (connect, disconnect, connections, config)
//! - Hidden agent sub-commands that keep one device tunnel alive

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cvdr::agent::{init_file_logging, run_agent, AgentArgs};
use cvdr::commands::{self, ConnectOptions};
use cvdr_core::config::{self, CvdrConfig};
use cvdr_core::AgentKind;

#[derive(Parser)]
#[command(name = "cvdr")]
#[command(author, version, about = "Remote debug tunnels for cloud virtual devices")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, env = "CVDR_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Orchestration service URL (overrides config)
    #[arg(long)]
    service_url: Option<String>,

    /// Cloud zone (overrides config)
    #[arg(long)]
    zone: Option<String>,

    /// SOCKS5 proxy, `socks5://host:port` (overrides config)
    #[arg(long)]
    proxy: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to devices and attach them to adb
    Connect {
        /// Device ids on the host
        #[arg(required = true)]
        devices: Vec<String>,
        /// Host running the devices
        #[arg(long)]
        host: Option<String>,
        /// Keep tunnels in this process until Ctrl+C
        #[arg(short, long)]
        foreground: bool,
        /// Do not run `adb connect` for new tunnels
        #[arg(long)]
        no_adb: bool,
        /// Tunnel kind: signaling or proxy (chosen per host when omitted)
        #[arg(long)]
        agent: Option<AgentKind>,
    },

    /// Disconnect devices, every device of a host, or everything
    Disconnect {
        /// Device ids on the host (requires --host)
        devices: Vec<String>,
        /// Host whose devices to disconnect
        #[arg(long)]
        host: Option<String>,
        /// Do not run `adb disconnect`
        #[arg(long)]
        no_adb: bool,
    },

    /// List device connections
    #[command(alias = "list")]
    Connections {
        /// Only show connections of this host
        #[arg(long)]
        host: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    #[command(name = "signaling_agent", hide = true)]
    SignalingAgent(AgentArgs),

    #[command(name = "proxy_agent", hide = true)]
    ProxyAgent(AgentArgs),
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get specific config value
    Get { key: String },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    // Agents log to their own file and never read the config
    let (kind, args) = match cli.command {
        Commands::SignalingAgent(args) => (AgentKind::Signaling, args),
        Commands::ProxyAgent(args) => (AgentKind::Proxy, args),
        command => {
            tracing_subscriber::registry()
                .with(tracing_subscriber::EnvFilter::new(
                    std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
                ))
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .init();

            let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
            let mut cfg: CvdrConfig = if cli.config.is_some() {
                config::load_config(&config_path)
            } else {
                config::load_config_or_default(&config_path)
            }
            .with_context(|| format!("Failed to load config from {:?}", config_path))?;

            if let Some(url) = cli.service_url {
                cfg.service_url = url;
            }
            if let Some(zone) = cli.zone {
                cfg.zone = Some(zone);
            }
            if let Some(proxy) = cli.proxy {
                cfg.proxy = Some(proxy);
            }

            return run_command(command, &cfg, &config_path).await;
        }
    };

    init_file_logging(&args.log_file, if cli.verbose > 0 { "debug" } else { "info" })?;
    run_agent(kind, args).await
}

async fn run_command(command: Commands, cfg: &CvdrConfig, config_path: &Path) -> Result<()> {
    match command {
        Commands::Connect {
            devices,
            host,
            foreground,
            no_adb,
            agent,
        } => {
            cfg.validate().context("Invalid configuration")?;
            commands::connect_command(
                cfg,
                ConnectOptions {
                    host,
                    devices,
                    foreground,
                    no_adb,
                    agent,
                },
            )
            .await?;
        }

        Commands::Disconnect {
            devices,
            host,
            no_adb,
        } => {
            cfg.validate().context("Invalid configuration")?;
            commands::disconnect_command(cfg, host, devices, no_adb).await?;
        }

        Commands::Connections { host } => {
            commands::connections_command(cfg, host.as_deref())?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(cfg, config_path)?,
            ConfigAction::Get { key } => commands::config_get(cfg, &key)?,
            ConfigAction::Path => commands::config_path(config_path),
        },

        Commands::SignalingAgent(_) | Commands::ProxyAgent(_) => {
            anyhow::bail!("agent sub-commands do not read the configuration")
        }
    }

    Ok(())
}
