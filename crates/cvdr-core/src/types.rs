//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;
use cvdr_protocol::ConnectionStatus;

/// Identifies one virtual device on one cloud host
///
/// Two locators are equal only if all three fields match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceLocator {
    /// Base URL of the orchestration service
    pub service_endpoint: String,
    /// Host name as known to the service
    pub host: String,
    /// Device identifier on that host
    pub device_id: String,
}

impl DeviceLocator {
    /// Create a new locator
    pub fn new(
        service_endpoint: impl Into<String>,
        host: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            service_endpoint: service_endpoint.into(),
            host: host.into(),
            device_id: device_id.into(),
        }
    }

    /// Reject locators with empty fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("service endpoint", &self.service_endpoint),
            ("host", &self.host),
            ("device id", &self.device_id),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "{} for device {}",
                    name, self
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host, self.device_id)
    }
}

/// Transport strategy used by a connection agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Peer-to-peer data channel negotiated through the service
    Signaling,
    /// Plain TCP to the device's debug port, optionally via SOCKS5
    Proxy,
}

impl AgentKind {
    /// Hidden CLI sub-command that runs this agent
    pub fn subcommand(&self) -> &'static str {
        match self {
            AgentKind::Signaling => "signaling_agent",
            AgentKind::Proxy => "proxy_agent",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Signaling => write!(f, "signaling"),
            AgentKind::Proxy => write!(f, "proxy"),
        }
    }
}

impl FromStr for AgentKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "signaling" | "webrtc" => Ok(AgentKind::Signaling),
            "proxy" | "direct" => Ok(AgentKind::Proxy),
            other => Err(ConfigError::Invalid(format!(
                "unknown connect agent {:?} (expected \"signaling\" or \"proxy\")",
                other
            ))),
        }
    }
}

/// How a host's devices can be reached from here
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// Only through the service's signaling relay
    Relay,
    /// The host's network address is directly dialable
    Direct { address: String },
}

impl Reachability {
    /// Agent kind used when the caller has no preference
    pub fn preferred_agent(&self) -> AgentKind {
        match self {
            Reachability::Relay => AgentKind::Signaling,
            Reachability::Direct { .. } => AgentKind::Proxy,
        }
    }
}

/// A SOCKS5 proxy address parsed from a `socks5://host:port` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub host: String,
    pub port: u16,
}

impl ProxyAddress {
    /// Parse a proxy URL; only the `socks5` scheme is accepted
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidProxy {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let url = url::Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "socks5" {
            return Err(invalid("only socks5 proxies are supported"));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing proxy host"))?;
        let port = url.port().ok_or_else(|| invalid("missing proxy port"))?;

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
        })
    }

    /// `host:port` form suitable for dialing
    pub fn dial_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://{}", self.dial_address())
    }
}

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// ICE configuration handed to the signaling agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl IceConfig {
    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IceConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|e| ConfigError::IceConfig {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Persisted record of one device connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub locator: DeviceLocator,
    pub status: ConnectionStatus,
    /// Process hosting the agent, once known
    #[serde(default)]
    pub agent_pid: Option<u32>,
    pub agent_kind: AgentKind,
    pub log_file: PathBuf,
    pub control_socket: PathBuf,
    /// Unix timestamp (seconds) of the connection attempt
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_display() {
        let locator = DeviceLocator::new("http://svc", "host-1", "dev-7");
        assert_eq!(locator.to_string(), "host-1/dev-7");
    }

    #[test]
    fn test_locator_equality_is_exact() {
        let a = DeviceLocator::new("http://svc", "host-1", "dev-7");
        let b = DeviceLocator::new("http://svc/", "host-1", "dev-7");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_locator_validate_rejects_empty_fields() {
        assert!(DeviceLocator::new("http://svc", "host-1", "dev-7")
            .validate()
            .is_ok());
        assert!(DeviceLocator::new("http://svc", "", "dev-7")
            .validate()
            .is_err());
        assert!(DeviceLocator::new("", "host-1", "dev-7")
            .validate()
            .is_err());
        assert!(DeviceLocator::new("http://svc", "host-1", " ")
            .validate()
            .is_err());
    }

    #[test]
    fn test_reachability_selects_agent() {
        assert_eq!(Reachability::Relay.preferred_agent(), AgentKind::Signaling);
        let direct = Reachability::Direct {
            address: "10.0.0.4".into(),
        };
        assert_eq!(direct.preferred_agent(), AgentKind::Proxy);
    }

    #[test]
    fn test_agent_kind_parse() {
        assert_eq!("proxy".parse::<AgentKind>().unwrap(), AgentKind::Proxy);
        assert_eq!(
            "signaling".parse::<AgentKind>().unwrap(),
            AgentKind::Signaling
        );
        assert!("carrier-pigeon".parse::<AgentKind>().is_err());
    }

    #[test]
    fn test_proxy_parse() {
        let proxy = ProxyAddress::parse("socks5://localhost:1080").unwrap();
        assert_eq!(proxy.host, "localhost");
        assert_eq!(proxy.port, 1080);
        assert_eq!(proxy.dial_address(), "localhost:1080");

        let v6 = ProxyAddress::parse("socks5://[::1]:1080").unwrap();
        assert_eq!(v6.dial_address(), "[::1]:1080");
    }

    #[test]
    fn test_proxy_parse_rejects_other_schemes() {
        for raw in ["http://localhost:3128", "socks5://localhost", "not a url"] {
            assert!(
                matches!(
                    ProxyAddress::parse(raw),
                    Err(ConfigError::InvalidProxy { .. })
                ),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn test_ice_config_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ice.json");
        std::fs::write(
            &path,
            r#"{"ice_servers":[{"urls":["stun:stun.example.com:19302"]}]}"#,
        )
        .unwrap();

        let config = IceConfig::load(&path).unwrap();
        assert_eq!(config.ice_servers.len(), 1);
        assert!(config.ice_servers[0].username.is_none());

        std::fs::write(&path, "{").unwrap();
        assert!(IceConfig::load(&path).is_err());
        assert!(IceConfig::load(&dir.path().join("missing.json")).is_err());
    }
}
