//! Local debug bridge

use async_trait::async_trait;

use crate::error::CvdrError;

/// The local control-protocol client that consumes a tunnel's endpoint
#[async_trait]
pub trait DebugBridge: Send + Sync {
    /// Attach the bridge to `127.0.0.1:<port>`
    async fn attach(&self, port: u16) -> Result<(), CvdrError>;

    /// Detach the bridge from `127.0.0.1:<port>`
    async fn detach(&self, port: u16) -> Result<(), CvdrError>;
}
