//! Two-phase tunnel engine
//!
//! [`Negotiating`] opens the remote side, binds the local endpoint and emits
//! exactly one status report. Emitting the report is the point where a
//! sub-process agent detaches from its parent. [`Running`] then serves a
//! single local client until shutdown or until either side goes away.

use std::io::Write;
use std::path::PathBuf;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use cvdr_core::config::DEFAULT_BASE_CONTROL_PORT;
use cvdr_core::{DeviceLocator, TunnelError};
use cvdr_protocol::{encode_report, ConnectionStatus};

use crate::daemon;
use crate::endpoint::{LocalEndpoint, SocketFileGuard};
use crate::pump;
use crate::transport::{RemotePeer, RemoteTransport};

/// Where the single status report goes
#[derive(Debug)]
pub enum ReportChannel {
    /// First line of stdout, after which stdio is detached
    Stdio,
    /// Handed to an in-process caller
    Captured(oneshot::Sender<ConnectionStatus>),
}

impl ReportChannel {
    fn emit(self, status: ConnectionStatus) -> Result<(), TunnelError> {
        match self {
            ReportChannel::Stdio => {
                let line = encode_report(&status)
                    .map_err(|e| TunnelError::Io(std::io::Error::other(e.to_string())))?;
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&line)?;
                stdout.flush()?;
                drop(stdout);
                daemon::detach_stdio()?;
                Ok(())
            }
            ReportChannel::Captured(tx) => {
                // A caller that stopped waiting no longer needs the report
                if tx.send(status).is_err() {
                    tracing::debug!("Status report receiver dropped");
                }
                Ok(())
            }
        }
    }
}

/// Local endpoint settings
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub socket_path: PathBuf,
    pub base_control_port: u16,
}

impl EngineOptions {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            base_control_port: DEFAULT_BASE_CONTROL_PORT,
        }
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.base_control_port = port;
        self
    }
}

/// Phase one: nothing reported yet
pub struct Negotiating {
    locator: DeviceLocator,
    options: EngineOptions,
    report: ReportChannel,
}

impl Negotiating {
    pub fn new(locator: DeviceLocator, options: EngineOptions, report: ReportChannel) -> Self {
        Self {
            locator,
            options,
            report,
        }
    }

    /// Open the remote side, bind locally and report
    ///
    /// On error nothing has been reported.
    pub async fn establish<T: RemoteTransport>(self, transport: T) -> Result<Running, TunnelError> {
        tracing::info!("Connecting {} via {}", self.locator, transport.describe());
        let peer = transport.open().await?;

        let endpoint =
            LocalEndpoint::bind(&self.options.socket_path, self.options.base_control_port).await?;
        let status = ConnectionStatus::connected(endpoint.port());
        let guard = SocketFileGuard::new(endpoint.socket_path());

        self.report.emit(status)?;
        tracing::info!("Tunnel for {} ready at {}", self.locator, status);

        Ok(Running {
            locator: self.locator,
            status,
            endpoint,
            peer,
            _guard: guard,
        })
    }
}

/// Phase two: reported, serving one client
pub struct Running {
    locator: DeviceLocator,
    status: ConnectionStatus,
    endpoint: LocalEndpoint,
    peer: RemotePeer,
    _guard: SocketFileGuard,
}

impl Running {
    /// The status that was reported
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Serve one local client until shutdown or either side closes
    ///
    /// A remote session that ends before any client attaches also ends the
    /// engine. The control socket file is gone when this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        let Running {
            locator,
            endpoint,
            peer,
            _guard,
            ..
        } = self;

        let client = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Tunnel for {} shut down before a client connected", locator);
                return Ok(());
            }
            accepted = endpoint.accept() => accepted?,
            gone = peer.closed() => {
                gone?;
                tracing::warn!("Remote side of {} closed before a client connected", locator);
                return Ok(());
            }
        };
        tracing::info!("Client {} attached to {}", client.peer, locator);

        let rejector = endpoint.reject_further();
        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Tunnel for {} shutting down", locator);
                Ok(())
            }
            end = pump::bridge(client, peer) => end.map(|_| ()),
        };
        rejector.abort();

        result
    }
}
