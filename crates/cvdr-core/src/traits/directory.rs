//! Orchestration service lookups

use async_trait::async_trait;

use crate::error::CvdrError;
use crate::types::{DeviceLocator, Reachability};

/// Answers where a device lives and how to reach it
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// How the device's host can be reached from this machine
    async fn resolve(&self, locator: &DeviceLocator) -> Result<Reachability, CvdrError>;

    /// `host:port` of the device's debug port, for direct dialing
    async fn debug_endpoint(&self, locator: &DeviceLocator) -> Result<String, CvdrError>;
}
