//! Connection status record

use serde::{Deserialize, Serialize};
use std::fmt;

/// Progress of a device connection's control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    /// Negotiation in progress, no local endpoint yet
    Connecting,
    /// Local endpoint is up and bridged to the device
    Connected,
    /// Tunnel was torn down
    Disconnected,
    /// The attempt failed; a new attempt starts from scratch
    Error,
}

impl fmt::Display for ControlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlState::Connecting => write!(f, "connecting"),
            ControlState::Connected => write!(f, "connected"),
            ControlState::Disconnected => write!(f, "disconnected"),
            ControlState::Error => write!(f, "error"),
        }
    }
}

/// Status of a device connection as reported by its agent
///
/// `control_port` is only present once a usable local endpoint exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    pub control_state: ControlState,
}

impl ConnectionStatus {
    /// Status of an attempt that has not produced an endpoint yet
    pub fn connecting() -> Self {
        Self {
            control_port: None,
            control_state: ControlState::Connecting,
        }
    }

    /// Status of a live tunnel listening on `port`
    pub fn connected(port: u16) -> Self {
        Self {
            control_port: Some(port),
            control_state: ControlState::Connected,
        }
    }

    /// Whether the tunnel is usable
    pub fn is_connected(&self) -> bool {
        self.control_state == ControlState::Connected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.control_port {
            Some(port) => write!(f, "127.0.0.1:{}", port),
            None => write!(f, "{}", self.control_state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(ConnectionStatus::connected(5555).to_string(), "127.0.0.1:5555");
        assert_eq!(ConnectionStatus::connecting().to_string(), "connecting");
        let failed = ConnectionStatus {
            control_port: None,
            control_state: ControlState::Error,
        };
        assert_eq!(failed.to_string(), "error");
    }

    #[test]
    fn test_port_omitted_when_absent() {
        let json = serde_json::to_string(&ConnectionStatus::connecting()).unwrap();
        assert_eq!(json, r#"{"control_state":"connecting"}"#);
    }

    #[test]
    fn test_parse_connected() {
        let status: ConnectionStatus =
            serde_json::from_str(r#"{"control_port":5557,"control_state":"connected"}"#).unwrap();
        assert_eq!(status, ConnectionStatus::connected(5557));
        assert!(status.is_connected());
    }
}
