use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tokio_tungstenite::tungstenite::Bytes;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::{Result, ShipError};
use crate::protocol::{BlocksRequest, ShipProtocol};
use crate::validation::ValidatedShipServer;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_MAX_PAYLOAD_MB: usize = 256;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShipEndpoint {
    pub label: String,
    pub url: String,
}

impl ShipEndpoint {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }

    /// Labels bare urls as `primary`, `node-2`, `node-3`...
    pub fn from_urls<S: AsRef<str>>(urls: &[S]) -> Vec<Self> {
        urls.iter()
            .enumerate()
            .map(|(idx, url)| {
                let label = if idx == 0 {
                    "primary".to_string()
                } else {
                    format!("node-{}", idx + 1)
                };
                Self::new(label, url.as_ref())
            })
            .collect()
    }
}

impl std::fmt::Display for ShipEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}) {}", self.label, self.url)
    }
}

#[derive(Debug)]
pub enum ShipEvent {
    Message(Bytes),
    Disconnected,
    Error(ShipError),
}

/// Endpoint list plus the reconnect intent shared by a reader's successive
/// connections. Reconnection policy is left to the caller.
#[derive(Debug, Clone)]
pub struct StateHistorySocket {
    endpoints: Vec<ShipEndpoint>,
    active_index: usize,
    max_payload_mb: usize,
    connect_timeout: Duration,
    retry_on_disconnect: bool,
}

impl StateHistorySocket {
    pub fn new(endpoints: Vec<ShipEndpoint>, max_payload_mb: Option<usize>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ShipError::NoEndpoints);
        }
        Ok(Self {
            endpoints,
            active_index: 0,
            max_payload_mb: max_payload_mb.unwrap_or(DEFAULT_MAX_PAYLOAD_MB),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            retry_on_disconnect: true,
        })
    }

    /// Socket restricted to the servers that passed validation.
    pub fn from_validated(
        servers: &[ValidatedShipServer],
        max_payload_mb: Option<usize>,
    ) -> Result<Self> {
        let endpoints = servers
            .iter()
            .filter(|server| server.active)
            .map(|server| server.node.clone())
            .collect();
        Self::new(endpoints, max_payload_mb)
    }

    pub fn endpoints(&self) -> &[ShipEndpoint] {
        &self.endpoints
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn active_endpoint(&self) -> &ShipEndpoint {
        &self.endpoints[self.active_index]
    }

    pub fn set_active_index(&mut self, index: usize) {
        self.active_index = index % self.endpoints.len();
    }

    pub fn use_next_ship(&mut self) {
        self.active_index = (self.active_index + 1) % self.endpoints.len();
        tracing::info!(
            target: crate::SHIP,
            "Switching to next endpoint: {}",
            self.active_endpoint()
        );
    }

    /// Bounds the websocket handshake plus the wait for the protocol ABI.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn retry_on_disconnect(&self) -> bool {
        self.retry_on_disconnect
    }

    pub fn max_payload_mb(&self) -> usize {
        self.max_payload_mb
    }

    #[cfg_attr(
        feature = "tracing-instrumentation",
        tracing::instrument(skip_all)
    )]
    pub async fn connect(&mut self) -> Result<ShipConnection> {
        let endpoint = self.active_endpoint().clone();
        tracing::debug!(target: crate::SHIP, "Connecting to {}...", endpoint);
        let connection = tokio::time::timeout(
            self.connect_timeout,
            ShipConnection::open(endpoint, self.max_payload_mb),
        )
        .await
        .map_err(|_| ShipError::Timeout(self.connect_timeout))??;
        tracing::info!(
            target: crate::SHIP,
            "Websocket connected! | Using {}",
            connection.endpoint()
        );
        Ok(connection)
    }

    /// A graceful close also drops the intent to reconnect.
    pub async fn close(&mut self, connection: ShipConnection, graceful: bool) {
        if graceful {
            self.retry_on_disconnect = false;
        }
        connection.close().await;
    }
}

/// Open websocket whose protocol ABI has already been received.
pub struct ShipConnection {
    endpoint: ShipEndpoint,
    stream: WsStream,
    protocol: Arc<ShipProtocol>,
}

impl ShipConnection {
    pub(crate) async fn open(endpoint: ShipEndpoint, max_payload_mb: usize) -> Result<Self> {
        let max_payload = max_payload_mb * 1024 * 1024;
        let config = WebSocketConfig::default()
            .max_message_size(Some(max_payload))
            .max_frame_size(Some(max_payload));
        let (mut stream, _) =
            tokio_tungstenite::connect_async_with_config(endpoint.url.as_str(), Some(config), false)
                .await
                .map_err(|err| ShipError::Connect {
                    url: endpoint.url.clone(),
                    reason: err.to_string(),
                })?;

        // the server pushes its schema before anything else
        let abi_text = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => break text.as_str().to_string(),
                Some(Ok(Message::Binary(data))) => {
                    break String::from_utf8(data.to_vec())
                        .map_err(|err| ShipError::Protocol(err.to_string()))?
                }
                Some(Ok(Message::Close(_))) | None => return Err(ShipError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
            }
        };
        let protocol = Arc::new(ShipProtocol::from_json(&abi_text)?);
        Ok(Self {
            endpoint,
            stream,
            protocol,
        })
    }

    pub fn endpoint(&self) -> &ShipEndpoint {
        &self.endpoint
    }

    pub fn protocol(&self) -> Arc<ShipProtocol> {
        Arc::clone(&self.protocol)
    }

    pub async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        self.stream.send(Message::Binary(payload.into())).await?;
        Ok(())
    }

    pub async fn send_status_request(&mut self) -> Result<()> {
        let payload = self.protocol.status_request()?;
        self.send(payload).await
    }

    pub async fn request_blocks(&mut self, request: &BlocksRequest) -> Result<()> {
        tracing::debug!(
            target: crate::SHIP,
            "Requesting blocks from {} to {} ({} in flight)",
            request.start_block_num,
            request.end_block_num,
            request.max_messages_in_flight
        );
        let payload = self.protocol.blocks_request(request)?;
        self.send(payload).await
    }

    /// Returns `num_messages` credits to the server.
    pub async fn ack(&mut self, num_messages: u32) -> Result<()> {
        let payload = self.protocol.ack_request(num_messages)?;
        self.send(payload).await
    }

    /// Cancel-safe: may be used as a `tokio::select!` branch.
    pub async fn next_event(&mut self) -> ShipEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return ShipEvent::Message(data),
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(target: crate::SHIP, "Websocket disconnected!");
                    return ShipEvent::Disconnected;
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!(
                        target: crate::SHIP,
                        "Ignoring text frame of {} bytes",
                        text.len()
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(target: crate::SHIP, "{} :: {}", self.endpoint, err);
                    return ShipEvent::Error(err.into());
                }
            }
        }
    }

    pub async fn close(mut self) {
        if let Err(err) = self.stream.close(None).await {
            tracing::debug!(target: crate::SHIP, "Error closing websocket: {}", err);
        }
    }
}
