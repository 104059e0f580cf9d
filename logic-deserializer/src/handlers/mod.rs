//! Enrichment handlers keyed by contract and action (or table).
//!
//! Handlers are registered once per deserializer. A handler bound to the
//! running chain id replaces a chain-agnostic one for the same key, never
//! the other way around. Lookup tries the exact contract first, then `*`.
use std::collections::HashMap;
use std::sync::Arc;

use ship_primitives::{ActionTrace, TableDelta, TableStateRow};

mod actions;
mod tables;

pub use actions::{
    DelegateBwHandler, NewAccountHandler, TransferHandler, UndelegateBwHandler,
    UnstakeToRexHandler, VoteProducerHandler,
};
pub use tables::{
    DelbandHandler, ProducersHandler, TokenAccountsHandler, UserResHandler, VotersHandler,
};

/// Matches any contract or any chain.
pub const ANY: &str = "*";
/// Payload layout the handlers are written against.
pub const PARSER_VERSION: &str = "3.2";

pub trait ActionHandler: Send + Sync {
    fn contract(&self) -> &str;

    fn action(&self) -> &str;

    fn chain(&self) -> &str {
        ANY
    }

    fn parser_versions(&self) -> &[&str] {
        &[PARSER_VERSION]
    }

    /// Adds derived `@<action>` fields to a decoded action.
    fn handle(&self, action: &mut ActionTrace);
}

pub trait DeltaHandler: Send + Sync {
    fn contract(&self) -> &str;

    fn table(&self) -> &str;

    fn chain(&self) -> &str {
        ANY
    }

    fn parser_versions(&self) -> &[&str] {
        &[PARSER_VERSION]
    }

    /// Adds derived `@<table>` fields to a decoded delta and optionally
    /// returns the present-state row it maps to.
    fn handle(&self, delta: &mut TableDelta) -> Option<TableStateRow>;
}

struct Registered<H: ?Sized> {
    chain_specific: bool,
    handler: Arc<H>,
}

type HandlerKey = (String, String);

pub struct HandlerRegistry {
    chain_id: Option<String>,
    actions: HashMap<HandlerKey, Registered<dyn ActionHandler>>,
    deltas: HashMap<HandlerKey, Registered<dyn DeltaHandler>>,
}

impl HandlerRegistry {
    pub fn new(chain_id: Option<String>) -> Self {
        Self {
            chain_id: chain_id.map(|id| id.to_lowercase()),
            actions: HashMap::new(),
            deltas: HashMap::new(),
        }
    }

    /// Registry with the stock token and system contract handlers.
    pub fn with_builtins(
        chain_id: Option<String>,
        eosio_alias: &str,
        features: &configuration::FeaturesConfig,
    ) -> Self {
        let mut registry = Self::new(chain_id);
        registry.register_action(Arc::new(TransferHandler::new(features.index_transfer_memo)));
        registry.register_action(Arc::new(DelegateBwHandler::new(eosio_alias)));
        registry.register_action(Arc::new(UndelegateBwHandler::new(eosio_alias)));
        registry.register_action(Arc::new(NewAccountHandler::new(eosio_alias)));
        registry.register_action(Arc::new(VoteProducerHandler::new(eosio_alias)));
        registry.register_action(Arc::new(UnstakeToRexHandler::new(eosio_alias)));

        registry.register_delta(Arc::new(TokenAccountsHandler::new(features.accounts_table)));
        registry.register_delta(Arc::new(VotersHandler::new(eosio_alias, features.voters_table)));
        registry.register_delta(Arc::new(ProducersHandler::new(eosio_alias)));
        registry.register_delta(Arc::new(UserResHandler::new(eosio_alias)));
        registry.register_delta(Arc::new(DelbandHandler::new(eosio_alias)));
        registry
    }

    fn accepts(&self, chain: &str, parser_versions: &[&str]) -> Option<bool> {
        if !parser_versions.contains(&PARSER_VERSION) {
            return None;
        }
        if chain == ANY {
            return Some(false);
        }
        match &self.chain_id {
            Some(chain_id) if chain.eq_ignore_ascii_case(chain_id) => Some(true),
            _ => None,
        }
    }

    /// Returns `false` when the handler does not apply to this chain or a
    /// chain-specific handler already owns the key.
    pub fn register_action(&mut self, handler: Arc<dyn ActionHandler>) -> bool {
        let Some(chain_specific) = self.accepts(handler.chain(), handler.parser_versions()) else {
            return false;
        };
        let key = (handler.contract().to_string(), handler.action().to_string());
        register(&mut self.actions, key, chain_specific, handler)
    }

    pub fn register_delta(&mut self, handler: Arc<dyn DeltaHandler>) -> bool {
        let Some(chain_specific) = self.accepts(handler.chain(), handler.parser_versions()) else {
            return false;
        };
        let key = (handler.contract().to_string(), handler.table().to_string());
        register(&mut self.deltas, key, chain_specific, handler)
    }

    pub fn action_handler(&self, contract: &str, action: &str) -> Option<&dyn ActionHandler> {
        lookup(&self.actions, contract, action)
    }

    pub fn delta_handler(&self, contract: &str, table: &str) -> Option<&dyn DeltaHandler> {
        lookup(&self.deltas, contract, table)
    }

    /// Runs the matching action handler, returns whether one ran.
    pub fn apply_action(&self, action: &mut ActionTrace) -> bool {
        match self.action_handler(&action.act.account, &action.act.name) {
            Some(handler) => {
                handler.handle(action);
                true
            }
            None => false,
        }
    }

    pub fn apply_delta(&self, delta: &mut TableDelta) -> Option<TableStateRow> {
        self.delta_handler(&delta.code, &delta.table)
            .and_then(|handler| handler.handle(delta))
    }
}

fn register<H: ?Sized>(
    map: &mut HashMap<HandlerKey, Registered<H>>,
    key: HandlerKey,
    chain_specific: bool,
    handler: Arc<H>,
) -> bool {
    if let Some(existing) = map.get(&key) {
        if existing.chain_specific && !chain_specific {
            return false;
        }
    }
    map.insert(
        key,
        Registered {
            chain_specific,
            handler,
        },
    );
    true
}

fn lookup<'a, H: ?Sized>(
    map: &'a HashMap<HandlerKey, Registered<H>>,
    contract: &str,
    name: &str,
) -> Option<&'a H> {
    map.get(&(contract.to_string(), name.to_string()))
        .or_else(|| map.get(&(ANY.to_string(), name.to_string())))
        .map(|registered| registered.handler.as_ref())
}

/// Reads a number that may be rendered as a JSON number or a decimal string.
pub(crate) fn as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Splits `"1.0000 EOS"` into amount and symbol.
pub(crate) fn split_asset(value: &serde_json::Value) -> Option<(f64, String)> {
    let (amount, symbol) = value.as_str()?.split_once(' ')?;
    Some((amount.parse().ok()?, symbol.to_string()))
}
