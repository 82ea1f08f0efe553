//! Remote side of a tunnel
//!
//! A [`RemoteTransport`] opens the device end of a tunnel. The proxy variant
//! yields a byte stream; the signaling variant yields a message-oriented
//! [`DataChannel`].

mod proxy;
mod websocket;

pub use proxy::ProxyTransport;
pub use websocket::{SignalingReply, SignalingRequest, WebSocketSignaling};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;

use cvdr_core::TunnelError;

/// An opened remote peer
pub enum RemotePeer {
    /// Byte stream to the device's debug port
    Stream(TcpStream),
    /// Negotiated data channel
    Channel(Box<dyn DataChannel>),
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemotePeer::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
            RemotePeer::Channel(_) => f.write_str("Channel(..)"),
        }
    }
}

impl RemotePeer {
    /// Resolves once the remote side ends the session
    ///
    /// Data that arrives first stays queued for the client.
    pub async fn closed(&self) -> Result<(), TunnelError> {
        match self {
            RemotePeer::Stream(stream) => {
                let mut byte = [0u8; 1];
                if stream.peek(&mut byte).await? == 0 {
                    return Ok(());
                }
                std::future::pending().await
            }
            RemotePeer::Channel(channel) => channel.closed().await,
        }
    }
}

/// Opens the remote side of a tunnel
#[async_trait]
pub trait RemoteTransport: Send {
    /// Short description of what is being dialed, for logs
    fn describe(&self) -> String;

    /// Establish the remote side
    async fn open(self) -> Result<RemotePeer, TunnelError>;
}

/// Message-oriented channel to a device
///
/// Sending and receiving may run concurrently from two tasks sharing the
/// channel.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send one message
    async fn send(&self, data: Bytes) -> Result<(), TunnelError>;

    /// Next message, or `None` once the peer closed the channel
    async fn recv(&self) -> Result<Option<Bytes>, TunnelError>;

    /// Close the channel
    async fn close(&self) -> Result<(), TunnelError>;

    /// Resolves once the peer ends the session, keeping any data for `recv`
    ///
    /// Channels that cannot watch the session without consuming it never
    /// resolve.
    async fn closed(&self) -> Result<(), TunnelError> {
        std::future::pending().await
    }
}

/// Performs the signaling exchange that yields a data channel
#[async_trait]
pub trait SignalingTransport: Send {
    async fn negotiate(self) -> Result<Box<dyn DataChannel>, TunnelError>;

    fn describe(&self) -> String;
}

/// Adapts a [`SignalingTransport`] to a [`RemoteTransport`]
pub struct ChannelTransport<S> {
    signaling: S,
}

impl<S: SignalingTransport> ChannelTransport<S> {
    pub fn new(signaling: S) -> Self {
        Self { signaling }
    }
}

#[async_trait]
impl<S: SignalingTransport + 'static> RemoteTransport for ChannelTransport<S> {
    fn describe(&self) -> String {
        self.signaling.describe()
    }

    async fn open(self) -> Result<RemotePeer, TunnelError> {
        let channel = self.signaling.negotiate().await?;
        Ok(RemotePeer::Channel(channel))
    }
}
