//! cvdr-agent: Tunnel engine for cvdr
//!
//! An agent bridges one local control-protocol client to one remote device.
//! It negotiates the remote side, binds a local endpoint, reports the
//! resulting status exactly once and then keeps pumping bytes until it is
//! told to stop or either side goes away.

pub mod daemon;
pub mod endpoint;
pub mod engine;
pub mod pump;
pub mod socks5;
pub mod transport;

pub use endpoint::{LocalClient, LocalEndpoint};
pub use engine::{EngineOptions, Negotiating, ReportChannel, Running};
pub use transport::{
    ChannelTransport, DataChannel, ProxyTransport, RemotePeer, RemoteTransport,
    SignalingTransport, WebSocketSignaling,
};
