use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipError};
use crate::protocol::{ShipResult, StatusResult};
use crate::socket::{ShipConnection, ShipEndpoint, ShipEvent, StateHistorySocket};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValidatedShipServer {
    pub node: ShipEndpoint,
    pub chain_id: String,
    pub active: bool,
    pub trace_begin_block: u32,
    pub trace_end_block: u32,
    pub chain_state_begin_block: u32,
}

impl ValidatedShipServer {
    fn inactive(node: ShipEndpoint) -> Self {
        Self {
            node,
            chain_id: String::new(),
            active: false,
            trace_begin_block: 0,
            trace_end_block: 0,
            chain_state_begin_block: 0,
        }
    }
}

impl StateHistorySocket {
    /// Probes every endpoint and keeps the ones serving `expected_chain_id`,
    /// dropping duplicate urls.
    #[cfg_attr(
        feature = "tracing-instrumentation",
        tracing::instrument(skip_all)
    )]
    pub async fn validate_ship_servers(&self, expected_chain_id: &str) -> Vec<ValidatedShipServer> {
        let mut servers = Vec::with_capacity(self.endpoints().len());
        for endpoint in self.endpoints() {
            servers.push(test_ship_server(endpoint.clone(), self.max_payload_mb()).await);
        }

        let expected = expected_chain_id.to_lowercase();
        let mut unique_urls = HashSet::new();
        servers
            .into_iter()
            .filter(|server| {
                if server.chain_id == expected {
                    return true;
                }
                if !server.chain_id.is_empty() {
                    tracing::warn!(
                        target: crate::SHIP,
                        "Removing SHIP Server {} :: {}",
                        server.node.url,
                        ShipError::ChainMismatch {
                            expected: expected.clone(),
                            found: server.chain_id.clone(),
                        }
                    );
                }
                false
            })
            .filter(|server| {
                if unique_urls.insert(server.node.url.clone()) {
                    true
                } else {
                    tracing::warn!(
                        target: crate::SHIP,
                        "Removing SHIP Server {} :: Duplicate URL",
                        server.node.url
                    );
                    false
                }
            })
            .collect()
    }
}

async fn test_ship_server(endpoint: ShipEndpoint, max_payload_mb: usize) -> ValidatedShipServer {
    tracing::info!(target: crate::SHIP, "Testing SHIP Server {}", endpoint.url);
    match tokio::time::timeout(PROBE_TIMEOUT, probe(endpoint.clone(), max_payload_mb)).await {
        Ok(Ok(status)) => ValidatedShipServer {
            node: endpoint,
            chain_id: status.chain_id.unwrap_or_default().to_lowercase(),
            active: true,
            trace_begin_block: status.trace_begin_block,
            trace_end_block: status.trace_end_block,
            chain_state_begin_block: status.chain_state_begin_block,
        },
        Ok(Err(err)) => {
            tracing::warn!(
                target: crate::SHIP,
                "{} SHIP Test Failed {} :: {}",
                endpoint.label,
                endpoint.url,
                err
            );
            ValidatedShipServer::inactive(endpoint)
        }
        Err(_) => {
            tracing::warn!(
                target: crate::SHIP,
                "Testing SHIP Server {} :: {}",
                endpoint.url,
                ShipError::Timeout(PROBE_TIMEOUT)
            );
            ValidatedShipServer::inactive(endpoint)
        }
    }
}

async fn probe(endpoint: ShipEndpoint, max_payload_mb: usize) -> Result<StatusResult> {
    let mut connection = ShipConnection::open(endpoint, max_payload_mb).await?;
    let protocol = connection.protocol();
    connection.send_status_request().await?;
    loop {
        match connection.next_event().await {
            ShipEvent::Message(frame) => {
                if let ShipResult::Status(status) = protocol.decode_result(&frame)? {
                    if status.chain_id.is_some() {
                        connection.close().await;
                        return Ok(status);
                    }
                }
            }
            ShipEvent::Disconnected => return Err(ShipError::Closed),
            ShipEvent::Error(err) => return Err(err),
        }
    }
}
