//! Client side of the state history websocket protocol.
mod chain_api;
mod error;
mod protocol;
mod socket;
mod validation;

pub use chain_api::{ChainApiClient, ChainInfo};
pub use error::{Result, ShipError};
pub use protocol::{
    BlockPosition, BlocksRequest, BlocksResult, ShipProtocol, ShipResult, StatusResult,
};
pub use socket::{ShipConnection, ShipEndpoint, ShipEvent, StateHistorySocket, WsStream};
pub use validation::ValidatedShipServer;

pub(crate) const SHIP: &str = "ship";
