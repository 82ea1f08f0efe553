//! Agent launchers
//!
//! A launcher starts the tunnel engine for one device and waits for its
//! single status report. [`SubprocessLauncher`] re-executes the cvdr binary
//! as a detached agent process; [`InProcessLauncher`] hosts the engine on the
//! current runtime and hands back an [`AgentController`] to stop it.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use cvdr_agent::{
    ChannelTransport, EngineOptions, Negotiating, ProxyTransport, RemoteTransport, ReportChannel,
    WebSocketSignaling,
};
use cvdr_core::{
    AgentKind, ConfigError, CvdrError, DeviceLocator, IceConfig, ProxyAddress, TunnelError,
};
use cvdr_protocol::{decode_report, ConnectionStatus, ProtocolError, StatusReportCodec};

/// Everything an agent needs to bring up one tunnel
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub locator: DeviceLocator,
    pub kind: AgentKind,
    pub socket_path: PathBuf,
    pub log_file: PathBuf,
    pub base_control_port: u16,
    pub proxy: Option<ProxyAddress>,
    pub ice_config: Option<PathBuf>,
    /// Debug port address (`host:port`), required by the proxy agent
    pub target: Option<String>,
}

/// A started agent that has reported its status
#[derive(Debug)]
pub struct LaunchedAgent {
    pub status: ConnectionStatus,
    /// Process hosting the agent
    pub pid: Option<u32>,
    /// Only set for agents hosted in this process
    pub controller: Option<AgentController>,
}

/// Starts tunnel engines
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Start an agent and wait for its status report
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedAgent, CvdrError>;
}

/// Handle to an engine running inside this process
#[derive(Debug)]
pub struct AgentController {
    token: CancellationToken,
    task: JoinHandle<Result<(), TunnelError>>,
}

impl AgentController {
    /// Token that stops the engine when cancelled
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the engine to stop on its own
    pub async fn wait(self) -> Result<(), CvdrError> {
        match self.task.await {
            Ok(result) => result.map_err(CvdrError::from),
            Err(e) => Err(CvdrError::Internal(format!("tunnel task failed: {}", e))),
        }
    }

    /// Stop the engine and wait for it
    pub async fn stop(self) -> Result<(), CvdrError> {
        self.token.cancel();
        self.wait().await
    }
}

/// Runs agents as detached child processes of a cvdr binary
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    program: PathBuf,
    prefix_args: Vec<OsString>,
}

impl SubprocessLauncher {
    /// Launch agents by re-executing the running binary
    pub fn current_exe() -> Result<Self, CvdrError> {
        let program = std::env::current_exe().map_err(CvdrError::AgentLaunch)?;
        Ok(Self::new(program))
    }

    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    /// Arguments placed before the agent sub-command
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Command-line arguments of the agent sub-command
    pub fn agent_args(request: &LaunchRequest) -> Vec<OsString> {
        let locator = &request.locator;
        let mut args: Vec<OsString> = vec![
            request.kind.subcommand().into(),
            locator.device_id.clone().into(),
            "--host".into(),
            locator.host.clone().into(),
            "--service-url".into(),
            locator.service_endpoint.clone().into(),
            "--log-file".into(),
            request.log_file.clone().into(),
            "--control-socket".into(),
            request.socket_path.clone().into(),
            "--base-port".into(),
            request.base_control_port.to_string().into(),
        ];
        if let Some(proxy) = &request.proxy {
            args.push("--proxy".into());
            args.push(proxy.to_string().into());
        }
        if let Some(ice) = &request.ice_config {
            args.push("--ice-config".into());
            args.push(ice.clone().into());
        }
        if let Some(target) = &request.target {
            args.push("--target".into());
            args.push(target.clone().into());
        }
        args
    }
}

#[async_trait]
impl AgentLauncher for SubprocessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedAgent, CvdrError> {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .args(Self::agent_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // New session: no controlling terminal, and Ctrl+C on the CLI never
        // reaches the agent
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // SAFETY: setsid is async-signal-safe and only affects the child
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = tokio::process::Command::from(cmd)
            .spawn()
            .map_err(CvdrError::AgentLaunch)?;
        let pid = child.id();
        tracing::debug!(
            "Started {} agent for {} (pid {:?})",
            request.kind,
            request.locator,
            pid
        );

        let stdout = child.stdout.take().ok_or_else(|| {
            CvdrError::AgentLaunch(std::io::Error::other("agent stdout was not captured"))
        })?;
        let mut lines = FramedRead::new(stdout, StatusReportCodec::new());

        let raw = match lines.next().await {
            Some(Ok(raw)) => raw,
            Some(Err(ProtocolError::Io(e))) => return Err(CvdrError::AgentLaunch(e)),
            Some(Err(e)) => {
                let _ = child.start_kill();
                return Err(malformed_output(request.locator, e));
            }
            None => {
                let exit = child.wait().await.ok().and_then(|status| status.code());
                return Err(CvdrError::AgentUnresponsive {
                    locator: request.locator,
                    exit,
                });
            }
        };

        match decode_report(&raw) {
            Ok(status) => Ok(LaunchedAgent {
                status,
                pid,
                controller: None,
            }),
            Err(e) => {
                let _ = child.start_kill();
                Err(malformed_output(request.locator, e))
            }
        }
    }
}

fn malformed_output(locator: DeviceLocator, error: ProtocolError) -> CvdrError {
    match error.into_malformed() {
        Ok((raw, source)) => CvdrError::MalformedAgentOutput {
            locator,
            raw,
            source,
        },
        Err(other) => CvdrError::AgentLaunch(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            other.to_string(),
        )),
    }
}

/// Hosts tunnel engines on the current tokio runtime
#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher;

impl InProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

fn spawn_engine<T>(
    negotiating: Negotiating,
    transport: T,
    token: CancellationToken,
) -> JoinHandle<Result<(), TunnelError>>
where
    T: RemoteTransport + 'static,
{
    tokio::spawn(async move {
        let running = negotiating.establish(transport).await?;
        running.run(token).await
    })
}

#[async_trait]
impl AgentLauncher for InProcessLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<LaunchedAgent, CvdrError> {
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let options = EngineOptions::new(&request.socket_path)
            .with_base_port(request.base_control_port);
        let negotiating = Negotiating::new(
            request.locator.clone(),
            options,
            ReportChannel::Captured(tx),
        );

        let task = match request.kind {
            AgentKind::Proxy => {
                let target = request.target.as_deref().ok_or_else(|| {
                    ConfigError::MissingField(format!(
                        "debug endpoint for proxy agent of {}",
                        request.locator
                    ))
                })?;
                let transport = ProxyTransport::new(target, request.proxy.clone())?;
                spawn_engine(negotiating, transport, token.clone())
            }
            AgentKind::Signaling => {
                let ice = request
                    .ice_config
                    .as_deref()
                    .map(IceConfig::load)
                    .transpose()?;
                let signaling = WebSocketSignaling::new(&request.locator, ice.as_ref())?;
                spawn_engine(negotiating, ChannelTransport::new(signaling), token.clone())
            }
        };

        match rx.await {
            Ok(status) => Ok(LaunchedAgent {
                status,
                pid: Some(std::process::id()),
                controller: Some(AgentController { token, task }),
            }),
            Err(_) => match task.await {
                Ok(Err(e)) => Err(CvdrError::Tunnel(e)),
                Ok(Ok(())) => Err(CvdrError::AgentUnresponsive {
                    locator: request.locator,
                    exit: None,
                }),
                Err(e) => Err(CvdrError::Internal(format!("tunnel task failed: {}", e))),
            },
        }
    }
}
