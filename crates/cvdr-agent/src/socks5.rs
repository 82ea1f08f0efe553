//! SOCKS5 client (RFC 1928), no-auth CONNECT only

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use cvdr_core::{ProxyAddress, TunnelError};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Dial `target_host:target_port` through a SOCKS5 proxy
pub async fn connect(
    proxy: &ProxyAddress,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, TunnelError> {
    let mut stream = TcpStream::connect(proxy.dial_address())
        .await
        .map_err(|source| TunnelError::Dial {
            target: proxy.to_string(),
            source,
        })?;

    tracing::debug!("Connected to proxy {}, requesting {}:{}", proxy, target_host, target_port);
    handshake(&mut stream, target_host, target_port).await?;
    Ok(stream)
}

/// Run the greeting and CONNECT exchange on an open proxy connection
pub async fn handshake<S>(stream: &mut S, target_host: &str, target_port: u16) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(TunnelError::Socks(format!(
            "unexpected protocol version {}",
            choice[0]
        )));
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_NONE_ACCEPTABLE => {
            return Err(TunnelError::Socks(
                "proxy requires authentication".to_string(),
            ))
        }
        other => {
            return Err(TunnelError::Socks(format!(
                "proxy selected unsupported method {:#04x}",
                other
            )))
        }
    }

    let request = connect_request(target_host, target_port)?;
    stream.write_all(&request).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(TunnelError::Socks(format!(
            "unexpected protocol version {} in reply",
            header[0]
        )));
    }
    if header[1] != 0x00 {
        return Err(TunnelError::Socks(format!(
            "CONNECT to {}:{} failed: {}",
            target_host,
            target_port,
            reply_message(header[1])
        )));
    }

    // Bound address is not used, but must be consumed
    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(TunnelError::Socks(format!(
                "unknown address type {} in reply",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

fn connect_request(host: &str, port: u16) -> Result<Vec<u8>, TunnelError> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(host.len())
                .ok()
                .filter(|len| *len > 0)
                .ok_or_else(|| TunnelError::Socks(format!("invalid target host {:?}", host)))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal proxy side: accept no-auth, record the request, answer `reply`
    async fn fake_proxy<S>(mut stream: S, reply: u8) -> Vec<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);
        stream.write_all(&[5, 0]).await.unwrap();

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        let rest = match head[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            _ => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                let mut domain = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut domain).await.unwrap();
                let mut request = head.to_vec();
                request.push(len[0]);
                request.extend(domain);
                stream
                    .write_all(&[5, reply, 0, 1, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                return request;
            }
        };
        let mut tail = vec![0u8; rest];
        stream.read_exact(&mut tail).await.unwrap();
        stream
            .write_all(&[5, reply, 0, 1, 127, 0, 0, 1, 0x1f, 0x90])
            .await
            .unwrap();
        let mut request = head.to_vec();
        request.extend(tail);
        request
    }

    #[tokio::test]
    async fn test_connect_by_domain() {
        let (mut client, server) = tokio::io::duplex(256);
        let proxy = tokio::spawn(fake_proxy(server, 0));

        handshake(&mut client, "cvd-host.internal", 6520).await.unwrap();

        let request = proxy.await.unwrap();
        assert_eq!(&request[..4], &[5, 1, 0, ATYP_DOMAIN]);
        assert_eq!(request[4] as usize, "cvd-host.internal".len());
        assert_eq!(&request[5..22], b"cvd-host.internal");
        assert_eq!(&request[22..], &6520u16.to_be_bytes());
    }

    #[tokio::test]
    async fn test_connect_by_ipv4() {
        let (mut client, server) = tokio::io::duplex(256);
        let proxy = tokio::spawn(fake_proxy(server, 0));

        handshake(&mut client, "10.1.2.3", 6520).await.unwrap();

        let request = proxy.await.unwrap();
        assert_eq!(request, vec![5, 1, 0, ATYP_IPV4, 10, 1, 2, 3, 0x19, 0x78]);
    }

    #[tokio::test]
    async fn test_refused_reply_is_error() {
        let (mut client, server) = tokio::io::duplex(256);
        let _proxy = tokio::spawn(fake_proxy(server, 0x05));

        let err = handshake(&mut client, "10.1.2.3", 6520).await.unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_auth_required_is_error() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            server.write_all(&[5, 0xFF]).await.unwrap();
        });

        let err = handshake(&mut client, "10.1.2.3", 6520).await.unwrap_err();
        assert!(matches!(err, TunnelError::Socks(_)));
    }
}
