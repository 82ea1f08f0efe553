//! Local endpoint of a tunnel
//!
//! A tunnel listens on its control socket and on a loopback TCP port at the
//! same time. Exactly one client is served: the first connection accepted on
//! either listener. Anything arriving later is closed straight away.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::task::JoinHandle;

use cvdr_core::TunnelError;

/// How many ports above the base are tried before giving up
const MAX_PORT_SCAN: u16 = 1000;

/// Read half of a local client connection
pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of a local client connection
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The single local client of a tunnel
pub struct LocalClient {
    /// Human-readable peer description for logs
    pub peer: String,
    reader: LocalReader,
    writer: LocalWriter,
}

impl LocalClient {
    fn from_unix(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer: "control socket".to_string(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    fn from_tcp(stream: TcpStream, addr: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            peer: addr.to_string(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split into independently owned halves
    pub fn into_split(self) -> (LocalReader, LocalWriter) {
        (self.reader, self.writer)
    }
}

/// Bound control socket plus loopback TCP listener
pub struct LocalEndpoint {
    socket_path: PathBuf,
    unix: UnixListener,
    tcp: TcpListener,
    port: u16,
}

impl LocalEndpoint {
    /// Bind both listeners
    ///
    /// A leftover socket file at `socket_path` is removed first. The TCP
    /// listener takes the first free port at or above `base_port`.
    pub async fn bind(socket_path: &Path, base_port: u16) -> Result<Self, TunnelError> {
        let listen_err = |source: io::Error| TunnelError::Listen {
            address: socket_path.display().to_string(),
            source,
        };

        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(listen_err)?;
        }
        match tokio::fs::remove_file(socket_path).await {
            Ok(()) => tracing::debug!("Removed stale control socket {:?}", socket_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(listen_err(e)),
        }

        let unix = UnixListener::bind(socket_path).map_err(listen_err)?;
        let (tcp, port) = match bind_loopback(base_port).await {
            Ok(bound) => bound,
            Err(e) => {
                let _ = std::fs::remove_file(socket_path);
                return Err(e);
            }
        };

        tracing::info!(
            "Listening on {:?} and 127.0.0.1:{}",
            socket_path,
            port
        );
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            unix,
            tcp,
            port,
        })
    }

    /// Loopback port reported as the control port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path of the control socket
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait for the first client on either listener
    pub async fn accept(&self) -> io::Result<LocalClient> {
        tokio::select! {
            accepted = self.unix.accept() => {
                let (stream, _) = accepted?;
                Ok(LocalClient::from_unix(stream))
            }
            accepted = self.tcp.accept() => {
                let (stream, addr) = accepted?;
                Ok(LocalClient::from_tcp(stream, addr))
            }
        }
    }

    /// Keep accepting in the background and close every new connection
    pub fn reject_further(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.accept().await {
                    Ok(client) => {
                        tracing::warn!(
                            "Rejecting connection from {}: tunnel already has a client",
                            client.peer
                        );
                    }
                    Err(e) => {
                        tracing::debug!("Stopped accepting extra clients: {}", e);
                        return;
                    }
                }
            }
        })
    }
}

async fn bind_loopback(base_port: u16) -> Result<(TcpListener, u16), TunnelError> {
    let last = base_port.saturating_add(MAX_PORT_SCAN);
    for port in base_port..=last {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => {
                return Err(TunnelError::Listen {
                    address: format!("127.0.0.1:{}", port),
                    source: e,
                })
            }
        }
    }
    Err(TunnelError::NoFreePort(base_port))
}

/// Removes a control socket file when dropped
pub struct SocketFileGuard {
    path: PathBuf,
}

impl SocketFileGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed control socket {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove control socket {:?}: {}", self.path, e),
        }
    }
}
