//! Collaborator traits at the edges of connection management

mod bridge;
mod directory;

pub use bridge::DebugBridge;
pub use directory::DeviceDirectory;
