//! Orchestration service client
//!
//! Only the two lookups the connection protocol needs:
//!
//! - `GET <endpoint>/hosts/<host>`: a host with a `docker.ip_address` is
//!   reachable directly, any other host only through the service relay.
//! - `GET <endpoint>/hosts/<host>/cvds`: the device's `adb_serial` carries
//!   the debug port on that address.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use cvdr_core::traits::DeviceDirectory;
use cvdr_core::{CvdrError, DeviceLocator, ProxyAddress, Reachability};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct HostInfo {
    #[serde(default)]
    docker: Option<DockerInstance>,
}

#[derive(Debug, Deserialize)]
struct DockerInstance {
    ip_address: String,
}

#[derive(Debug, Deserialize)]
struct CvdList {
    #[serde(default)]
    cvds: Vec<CvdInfo>,
}

#[derive(Debug, Deserialize)]
struct CvdInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    webrtc_device_id: String,
    #[serde(default)]
    adb_serial: String,
}

/// [`DeviceDirectory`] backed by the orchestration service's REST API
#[derive(Debug, Clone)]
pub struct HttpDeviceDirectory {
    client: reqwest::Client,
}

impl HttpDeviceDirectory {
    /// Build a client, routed through `proxy` when given
    pub fn new(proxy: Option<&ProxyAddress>) -> Result<Self, CvdrError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.to_string())
                .map_err(|e| CvdrError::Directory(format!("invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|e| CvdrError::Directory(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CvdrError> {
        tracing::debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CvdrError::Directory(format!("GET {}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CvdrError::Directory(format!(
                "GET {} returned {}",
                url, status
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CvdrError::Directory(format!("invalid response from {}: {}", url, e)))
    }

    async fn host(&self, locator: &DeviceLocator) -> Result<HostInfo, CvdrError> {
        let url = format!(
            "{}/hosts/{}",
            locator.service_endpoint.trim_end_matches('/'),
            locator.host
        );
        self.get_json(&url).await
    }
}

#[async_trait]
impl DeviceDirectory for HttpDeviceDirectory {
    async fn resolve(&self, locator: &DeviceLocator) -> Result<Reachability, CvdrError> {
        let host = self.host(locator).await?;
        Ok(reachability(host))
    }

    async fn debug_endpoint(&self, locator: &DeviceLocator) -> Result<String, CvdrError> {
        let address = match reachability(self.host(locator).await?) {
            Reachability::Direct { address } => address,
            Reachability::Relay => {
                return Err(CvdrError::Directory(format!(
                    "host {} has no direct address",
                    locator.host
                )))
            }
        };

        let url = format!(
            "{}/hosts/{}/cvds",
            locator.service_endpoint.trim_end_matches('/'),
            locator.host
        );
        let list: CvdList = self.get_json(&url).await?;
        let cvd = list
            .cvds
            .into_iter()
            .find(|c| c.webrtc_device_id == locator.device_id || c.name == locator.device_id)
            .ok_or_else(|| {
                CvdrError::Directory(format!(
                    "device {} not found on host {}",
                    locator.device_id, locator.host
                ))
            })?;

        join_debug_address(&address, &cvd.adb_serial)
    }
}

fn reachability(host: HostInfo) -> Reachability {
    match host.docker {
        Some(docker) if !docker.ip_address.is_empty() => Reachability::Direct {
            address: docker.ip_address,
        },
        _ => Reachability::Relay,
    }
}

/// Combine the host address with the port of an adb serial (`ip:port`)
fn join_debug_address(address: &str, adb_serial: &str) -> Result<String, CvdrError> {
    let port = adb_serial
        .rsplit_once(':')
        .map(|(_, port)| port)
        .filter(|port| !port.is_empty())
        .ok_or_else(|| {
            CvdrError::Directory(format!("no port in adb serial {:?}", adb_serial))
        })?;
    let port: u16 = port
        .parse()
        .map_err(|_| CvdrError::Directory(format!("invalid port in adb serial {:?}", adb_serial)))?;

    if address.contains(':') {
        Ok(format!("[{}]:{}", address, port))
    } else {
        Ok(format!("{}:{}", address, port))
    }
}
