//! Byte pumps between the local client and the remote peer
//!
//! Both directions run concurrently and independently. The bridge ends as
//! soon as either direction finishes or fails.

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use cvdr_core::TunnelError;

use crate::endpoint::{LocalClient, LocalReader, LocalWriter};
use crate::transport::{DataChannel, RemotePeer};

const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Which side stopped the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// The local client hung up (or its pump failed)
    Local,
    /// The remote peer hung up (or its pump failed)
    Remote,
}

/// Pump bytes between `client` and `peer` until one direction ends
pub async fn bridge(client: LocalClient, peer: RemotePeer) -> Result<BridgeEnd, TunnelError> {
    let peer_desc = client.peer.clone();
    let (local_rx, local_tx) = client.into_split();

    let result = match peer {
        RemotePeer::Stream(stream) => {
            let (remote_rx, remote_tx) = stream.into_split();
            bridge_streams(local_rx, local_tx, Box::new(remote_rx), Box::new(remote_tx)).await
        }
        RemotePeer::Channel(channel) => {
            let result = bridge_channel(local_rx, local_tx, channel.as_ref()).await;
            if let Err(e) = channel.close().await {
                tracing::debug!("Error closing data channel: {}", e);
            }
            result
        }
    };

    match &result {
        Ok(end) => tracing::info!("Bridge for {} ended ({:?} side closed)", peer_desc, end),
        Err(e) => tracing::error!("Bridge for {} failed: {}", peer_desc, e),
    }
    result
}

async fn bridge_streams(
    mut local_rx: LocalReader,
    mut local_tx: LocalWriter,
    mut remote_rx: LocalReader,
    mut remote_tx: LocalWriter,
) -> Result<BridgeEnd, TunnelError> {
    let upstream = async {
        let n = tokio::io::copy(&mut local_rx, &mut remote_tx).await?;
        tracing::debug!("Local to remote pump finished after {} bytes", n);
        let _ = remote_tx.shutdown().await;
        Ok::<_, std::io::Error>(BridgeEnd::Local)
    };
    let downstream = async {
        let n = tokio::io::copy(&mut remote_rx, &mut local_tx).await?;
        tracing::debug!("Remote to local pump finished after {} bytes", n);
        let _ = local_tx.shutdown().await;
        Ok::<_, std::io::Error>(BridgeEnd::Remote)
    };

    tokio::select! {
        end = upstream => Ok(end?),
        end = downstream => Ok(end?),
    }
}

async fn bridge_channel(
    mut local_rx: LocalReader,
    mut local_tx: LocalWriter,
    channel: &dyn DataChannel,
) -> Result<BridgeEnd, TunnelError> {
    let upstream = async {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            let n = local_rx.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, TunnelError>(BridgeEnd::Local);
            }
            channel.send(Bytes::copy_from_slice(&buf[..n])).await?;
        }
    };
    let downstream = async {
        while let Some(data) = channel.recv().await? {
            local_tx.write_all(&data).await?;
            local_tx.flush().await?;
        }
        let _ = local_tx.shutdown().await;
        Ok::<_, TunnelError>(BridgeEnd::Remote)
    };

    tokio::select! {
        end = upstream => end,
        end = downstream => end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::duplex;
    use tokio::sync::{mpsc, Mutex};

    /// Channel whose far end is a pair of mpsc queues
    struct QueueChannel {
        outgoing: mpsc::UnboundedSender<Bytes>,
        incoming: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    }

    #[async_trait]
    impl DataChannel for QueueChannel {
        async fn send(&self, data: Bytes) -> Result<(), TunnelError> {
            self.outgoing
                .send(data)
                .map_err(|_| TunnelError::Signaling("closed".into()))
        }

        async fn recv(&self) -> Result<Option<Bytes>, TunnelError> {
            Ok(self.incoming.lock().await.recv().await)
        }

        async fn close(&self) -> Result<(), TunnelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_streams_pump_both_ways() {
        let (local, mut local_far) = duplex(1024);
        let (remote, mut remote_far) = duplex(1024);
        let (lr, lw) = tokio::io::split(local);
        let (rr, rw) = tokio::io::split(remote);

        let bridge = tokio::spawn(bridge_streams(
            Box::new(lr),
            Box::new(lw),
            Box::new(rr),
            Box::new(rw),
        ));

        local_far.write_all(b"shell:ls").await.unwrap();
        let mut buf = [0u8; 8];
        remote_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"shell:ls");

        remote_far.write_all(b"OKAY").await.unwrap();
        let mut buf = [0u8; 4];
        local_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OKAY");

        drop(remote_far);
        assert_eq!(bridge.await.unwrap().unwrap(), BridgeEnd::Remote);
    }

    #[tokio::test]
    async fn test_channel_pump_ends_when_local_closes() {
        let (to_device, mut device_rx) = mpsc::unbounded_channel();
        let (device_tx, from_device) = mpsc::unbounded_channel();
        let channel = QueueChannel {
            outgoing: to_device,
            incoming: Mutex::new(from_device),
        };

        let (local, mut local_far) = duplex(1024);
        let (lr, lw) = tokio::io::split(local);

        let bridge = tokio::spawn(async move {
            bridge_channel(Box::new(lr), Box::new(lw), &channel).await
        });

        local_far.write_all(b"CNXN").await.unwrap();
        assert_eq!(&device_rx.recv().await.unwrap()[..], b"CNXN");

        device_tx.send(Bytes::from_static(b"AUTH")).unwrap();
        let mut buf = [0u8; 4];
        local_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AUTH");

        drop(local_far);
        assert_eq!(bridge.await.unwrap().unwrap(), BridgeEnd::Local);
    }
}
