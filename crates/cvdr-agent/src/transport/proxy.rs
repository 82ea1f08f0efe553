//! Direct or SOCKS5-proxied TCP to the device's debug port

use async_trait::async_trait;
use tokio::net::TcpStream;

use cvdr_core::{ProxyAddress, TunnelError};

use super::{RemotePeer, RemoteTransport};
use crate::socks5;

/// Dials the device's debug port, optionally through a SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct ProxyTransport {
    host: String,
    port: u16,
    proxy: Option<ProxyAddress>,
}

impl ProxyTransport {
    /// Target in `host:port` form; IPv6 hosts must be bracketed
    pub fn new(target: &str, proxy: Option<ProxyAddress>) -> Result<Self, TunnelError> {
        let (host, port) = target
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
            .filter(|(host, _)| !host.is_empty())
            .ok_or_else(|| TunnelError::Dial {
                target: target.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "expected host:port",
                ),
            })?;

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            proxy,
        })
    }

    fn target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[async_trait]
impl RemoteTransport for ProxyTransport {
    fn describe(&self) -> String {
        match &self.proxy {
            Some(proxy) => format!("{} via {}", self.target(), proxy),
            None => self.target(),
        }
    }

    async fn open(self) -> Result<RemotePeer, TunnelError> {
        let stream = match &self.proxy {
            Some(proxy) => socks5::connect(proxy, &self.host, self.port).await?,
            None => TcpStream::connect((self.host.as_str(), self.port))
                .await
                .map_err(|source| TunnelError::Dial {
                    target: self.target(),
                    source,
                })?,
        };
        let _ = stream.set_nodelay(true);

        tracing::info!("Connected to device at {}", self.describe());
        Ok(RemotePeer::Stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_target() {
        let t = ProxyTransport::new("10.0.0.4:6520", None).unwrap();
        assert_eq!(t.describe(), "10.0.0.4:6520");

        let v6 = ProxyTransport::new("[fd00::4]:6520", None).unwrap();
        assert_eq!(v6.describe(), "[fd00::4]:6520");

        let proxied = ProxyTransport::new(
            "host:6520",
            Some(ProxyAddress::parse("socks5://localhost:1080").unwrap()),
        )
        .unwrap();
        assert_eq!(proxied.describe(), "host:6520 via socks5://localhost:1080");

        assert!(ProxyTransport::new("no-port", None).is_err());
        assert!(ProxyTransport::new(":6520", None).is_err());
    }

    #[tokio::test]
    async fn test_direct_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let transport = ProxyTransport::new(&addr.to_string(), None).unwrap();
        let peer = transport.open().await.unwrap();
        assert!(matches!(peer, RemotePeer::Stream(_)));
        listener.accept().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ProxyTransport::new(&addr.to_string(), None)
            .unwrap()
            .open()
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Dial { .. }));
    }
}
