use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ShipError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connection closed")]
    Closed,
    #[error("chain id mismatch: expected {expected}, found {found}")]
    ChainMismatch { expected: String, found: String },
    #[error("no history endpoints configured")]
    NoEndpoints,
    #[error(transparent)]
    Abi(#[from] abi_codec::AbiError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, ShipError>;
