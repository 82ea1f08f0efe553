//! cvdr client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;
use crate::types::{AgentKind, ProxyAddress};

/// First loopback port tried for a tunnel's control endpoint
pub const DEFAULT_BASE_CONTROL_PORT: u16 = 5555;

/// Configuration for the cvdr CLI and its agents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CvdrConfig {
    /// Base URL of the orchestration service
    pub service_url: String,

    /// Zone passed to the service, if it is zonal
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,

    /// SOCKS5 proxy used to reach hosts (`socks5://host:port`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Directory holding connection records, control sockets and agent logs
    pub connection_control_dir: PathBuf,

    /// Agent log files older than this are deleted before new connections
    #[serde(with = "duration_secs")]
    pub log_files_delete_threshold: Duration,

    /// Force an agent kind; chosen from host reachability when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_agent: Option<AgentKind>,

    /// ICE servers for the signaling agent (JSON file)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ice_config: Option<PathBuf>,

    /// First loopback port tried for a tunnel's control endpoint
    pub base_control_port: u16,

    /// adb executable used to attach tunnels
    pub adb_path: String,
}

impl Default for CvdrConfig {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:1080".to_string(),
            zone: None,
            proxy: None,
            connection_control_dir: PathBuf::from("~/.cvdr/connections"),
            log_files_delete_threshold: Duration::from_secs(7 * 24 * 60 * 60),
            connect_agent: None,
            ice_config: None,
            base_control_port: DEFAULT_BASE_CONTROL_PORT,
            adb_path: "adb".to_string(),
        }
    }
}

impl CvdrConfig {
    /// Control directory with `~` expanded
    pub fn control_dir(&self) -> PathBuf {
        super::expand_home(&self.connection_control_dir)
    }

    /// Parsed proxy address, if one is configured
    pub fn proxy_address(&self) -> Result<Option<ProxyAddress>, ConfigError> {
        match self.proxy.as_deref().filter(|p| !p.is_empty()) {
            Some(raw) => ProxyAddress::parse(raw).map(Some),
            None => Ok(None),
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_url.trim().is_empty() {
            return Err(ConfigError::MissingField("service_url".to_string()));
        }
        if self.base_control_port == 0 {
            return Err(ConfigError::Invalid(
                "base_control_port must be non-zero".to_string(),
            ));
        }
        self.proxy_address()?;
        Ok(())
    }

    /// Look up one setting by its key, rendered as text
    ///
    /// Unset optional settings yield `None`, as do unknown keys.
    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let value = toml::Value::try_from(self)?;
        Ok(value.get(key).map(|v| match v {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        }))
    }

    /// API root of the orchestration service, scoped to the zone if set
    ///
    /// This is the `service_endpoint` of every locator the CLI builds.
    pub fn service_endpoint(&self) -> String {
        let base = self.service_url.trim_end_matches('/');
        match self.zone.as_deref().filter(|z| !z.is_empty()) {
            Some(zone) => format!("{}/v1/zones/{}", base, zone),
            None => format!("{}/v1", base),
        }
    }

    /// Every known setting key
    pub fn keys() -> &'static [&'static str] {
        &[
            "service_url",
            "zone",
            "proxy",
            "connection_control_dir",
            "log_files_delete_threshold",
            "connect_agent",
            "ice_config",
            "base_control_port",
            "adb_path",
        ]
    }
}
