//! WebSocket signaling transport
//!
//! The agent opens a WebSocket to
//! `<service>/hosts/<host>/devices/<device>/signaling`, sends one text
//! message carrying a [`SignalingRequest`] and waits for a text
//! [`SignalingReply`]. Once accepted, binary messages carry the device's
//! debug traffic in both directions.

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use cvdr_core::types::IceServer;
use cvdr_core::{DeviceLocator, IceConfig, TunnelError};

use super::{DataChannel, SignalingTransport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// First message sent by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingRequest {
    pub device_id: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

/// The service's answer to a [`SignalingRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingReply {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Signaling through the orchestration service over a WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketSignaling {
    url: Url,
    request: SignalingRequest,
}

impl WebSocketSignaling {
    pub fn new(locator: &DeviceLocator, ice: Option<&IceConfig>) -> Result<Self, TunnelError> {
        Ok(Self {
            url: signaling_url(locator)?,
            request: SignalingRequest {
                device_id: locator.device_id.clone(),
                ice_servers: ice.map(|c| c.ice_servers.clone()).unwrap_or_default(),
            },
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn signaling_url(locator: &DeviceLocator) -> Result<Url, TunnelError> {
    let invalid = |reason: String| {
        TunnelError::Signaling(format!(
            "invalid service endpoint {:?}: {}",
            locator.service_endpoint, reason
        ))
    };

    let mut url = Url::parse(&locator.service_endpoint).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {}", other))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch to a websocket scheme".to_string()))?;
    url.path_segments_mut()
        .map_err(|_| invalid("not a base URL".to_string()))?
        .pop_if_empty()
        .extend([
            "hosts",
            locator.host.as_str(),
            "devices",
            locator.device_id.as_str(),
            "signaling",
        ]);
    Ok(url)
}

fn ws_err(e: tungstenite::Error) -> TunnelError {
    TunnelError::Signaling(e.to_string())
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    fn describe(&self) -> String {
        self.url.to_string()
    }

    async fn negotiate(self) -> Result<Box<dyn DataChannel>, TunnelError> {
        tracing::debug!("Connecting to signaling endpoint {}", self.url);
        let (mut ws, _response) = connect_async(self.url.as_str()).await.map_err(ws_err)?;

        let request = serde_json::to_string(&self.request)
            .map_err(|e| TunnelError::Signaling(e.to_string()))?;
        ws.send(Message::Text(request)).await.map_err(ws_err)?;

        let reply = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    break serde_json::from_str::<SignalingReply>(&text).map_err(|e| {
                        TunnelError::Signaling(format!("invalid signaling reply {:?}: {}", text, e))
                    })?;
                }
                Some(Ok(Message::Ping(data))) => {
                    ws.send(Message::Pong(data)).await.map_err(ws_err)?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TunnelError::Signaling(
                        "signaling server closed the connection".to_string(),
                    ))
                }
                Some(Ok(other)) => {
                    tracing::debug!("Ignoring message before signaling reply: {:?}", other);
                }
                Some(Err(e)) => return Err(ws_err(e)),
            }
        };

        if !reply.accepted {
            return Err(TunnelError::Signaling(format!(
                "device {} rejected the connection: {}",
                self.request.device_id,
                reply.reason.as_deref().unwrap_or("no reason given")
            )));
        }

        tracing::info!("Data channel to {} established", self.request.device_id);
        let (sink, stream) = ws.split();
        Ok(Box::new(WebSocketChannel {
            sink: Mutex::new(sink),
            inbound: Mutex::new(Inbound {
                stream,
                backlog: VecDeque::new(),
            }),
        }))
    }
}

/// Data channel over an accepted signaling WebSocket
struct WebSocketChannel {
    sink: Mutex<SplitSink<WsStream, Message>>,
    inbound: Mutex<Inbound>,
}

/// Read half plus messages received while nobody was reading
struct Inbound {
    stream: SplitStream<WsStream>,
    backlog: VecDeque<Bytes>,
}

impl WebSocketChannel {
    /// Next binary message, answering pings on the way
    async fn next_data(
        &self,
        stream: &mut SplitStream<WsStream>,
    ) -> Result<Option<Bytes>, TunnelError> {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    tracing::trace!("Received {} bytes over data channel", data.len());
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.sink
                        .lock()
                        .await
                        .send(Message::Pong(data))
                        .await
                        .map_err(ws_err)?;
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("Data channel closed by remote");
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("Ignoring data channel message: {:?}", other);
                }
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(ws_err(e)),
            }
        }
    }
}

#[async_trait]
impl DataChannel for WebSocketChannel {
    async fn send(&self, data: Bytes) -> Result<(), TunnelError> {
        tracing::trace!("Sending {} bytes over data channel", data.len());
        self.sink
            .lock()
            .await
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(ws_err)
    }

    async fn recv(&self) -> Result<Option<Bytes>, TunnelError> {
        let mut inbound = self.inbound.lock().await;
        if let Some(data) = inbound.backlog.pop_front() {
            return Ok(Some(data));
        }
        self.next_data(&mut inbound.stream).await
    }

    async fn closed(&self) -> Result<(), TunnelError> {
        let mut inbound = self.inbound.lock().await;
        let Inbound { stream, backlog } = &mut *inbound;
        while let Some(data) = self.next_data(stream).await? {
            backlog.push_back(data);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        match self.sink.lock().await.close().await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(ws_err(e)),
        }
    }
}
