use serde_json::{json, Map, Value};
use ship_primitives::{TableDelta, TableStateRow};

use super::{as_f64, split_asset, DeltaHandler, ANY};

fn data_object(delta: &mut TableDelta) -> Option<&mut Map<String, Value>> {
    delta.data.as_object_mut()
}

fn stake_weights(data: &Map<String, Value>) -> Option<(f64, f64)> {
    let net = data.get("net_weight").and_then(split_asset)?.0;
    let cpu = data.get("cpu_weight").and_then(split_asset)?.0;
    Some((net, cpu))
}

/// Four decimals, the precision of system token amounts.
fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Token balances of any contract with an `accounts` table.
pub struct TokenAccountsHandler {
    store: bool,
}

impl TokenAccountsHandler {
    pub fn new(store: bool) -> Self {
        Self { store }
    }
}

impl DeltaHandler for TokenAccountsHandler {
    fn contract(&self) -> &str {
        ANY
    }

    fn table(&self) -> &str {
        "accounts"
    }

    fn handle(&self, delta: &mut TableDelta) -> Option<TableStateRow> {
        let (amount, symbol) = data_object(delta)?
            .get("balance")
            .and_then(split_asset)?;
        if let Some(data) = data_object(delta) {
            data.remove("balance");
        }
        delta.enrichment.insert(
            "@accounts".to_string(),
            json!({"amount": amount, "symbol": symbol}),
        );
        if !self.store {
            return None;
        }
        Some(TableStateRow {
            table: "accounts".to_string(),
            key: format!("{}-{}-{}", delta.code, delta.scope, symbol),
            block_num: delta.block_num,
            present: delta.present,
            data: json!({
                "code": delta.code,
                "scope": delta.scope,
                "amount": amount,
                "symbol": symbol,
                "present": delta.present,
                "block_num": delta.block_num,
            }),
        })
    }
}

/// Vote records of the system contract.
pub struct VotersHandler {
    system: String,
    store: bool,
}

impl VotersHandler {
    pub fn new(eosio_alias: &str, store: bool) -> Self {
        Self {
            system: eosio_alias.to_string(),
            store,
        }
    }
}

impl DeltaHandler for VotersHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn table(&self) -> &str {
        "voters"
    }

    fn handle(&self, delta: &mut TableDelta) -> Option<TableStateRow> {
        let data = data_object(delta)?;
        let voter = data
            .remove("owner")
            .and_then(|owner| owner.as_str().map(str::to_string));
        let mut voters = Map::new();
        voters.insert(
            "is_proxy".to_string(),
            data.remove("is_proxy").unwrap_or(Value::Null),
        );
        if let Some(proxy) = data.remove("proxy").filter(|proxy| proxy != "") {
            voters.insert("proxy".to_string(), proxy);
        }
        if let Some(producers) = data
            .remove("producers")
            .filter(|producers| producers.as_array().is_some_and(|list| !list.is_empty()))
        {
            voters.insert("producers".to_string(), producers);
        }
        for field in ["last_vote_weight", "proxied_vote_weight", "staked"] {
            let value = data.remove(field).as_ref().and_then(as_f64);
            voters.insert(field.to_string(), json!(value));
        }
        let voter = voter.unwrap_or_else(|| delta.payer.clone());
        let voters = Value::Object(voters);
        delta
            .enrichment
            .insert("@voters".to_string(), voters.clone());
        if !self.store {
            return None;
        }
        let mut document = voters;
        document["voter"] = voter.clone().into();
        document["primary_key"] = delta.primary_key.clone().into();
        document["block_num"] = delta.block_num.into();
        Some(TableStateRow {
            table: "voters".to_string(),
            key: voter,
            block_num: delta.block_num,
            present: delta.present,
            data: document,
        })
    }
}

pub struct ProducersHandler {
    system: String,
}

impl ProducersHandler {
    pub fn new(eosio_alias: &str) -> Self {
        Self {
            system: eosio_alias.to_string(),
        }
    }
}

impl DeltaHandler for ProducersHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn table(&self) -> &str {
        "producers"
    }

    fn handle(&self, delta: &mut TableDelta) -> Option<TableStateRow> {
        let data = data_object(delta)?;
        let producers = json!({
            "total_votes": data.get("total_votes").and_then(as_f64),
            "is_active": data.get("is_active"),
            "unpaid_blocks": data.get("unpaid_blocks"),
        });
        delta.data = Value::Null;
        delta.enrichment.insert("@producers".to_string(), producers);
        None
    }
}

pub struct UserResHandler {
    system: String,
}

impl UserResHandler {
    pub fn new(eosio_alias: &str) -> Self {
        Self {
            system: eosio_alias.to_string(),
        }
    }
}

impl DeltaHandler for UserResHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn table(&self) -> &str {
        "userres"
    }

    fn handle(&self, delta: &mut TableDelta) -> Option<TableStateRow> {
        let data = data_object(delta)?;
        let (net, cpu) = stake_weights(data)?;
        let userres = json!({
            "owner": data.get("owner"),
            "net_weight": net,
            "cpu_weight": cpu,
            "total_weight": round4(net + cpu),
            "ram_bytes": data.get("ram_bytes").and_then(as_f64).map(|bytes| bytes as i64),
        });
        delta.data = Value::Null;
        delta.enrichment.insert("@userres".to_string(), userres);
        None
    }
}

pub struct DelbandHandler {
    system: String,
}

impl DelbandHandler {
    pub fn new(eosio_alias: &str) -> Self {
        Self {
            system: eosio_alias.to_string(),
        }
    }
}

impl DeltaHandler for DelbandHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn table(&self) -> &str {
        "delband"
    }

    fn handle(&self, delta: &mut TableDelta) -> Option<TableStateRow> {
        let data = data_object(delta)?;
        let (net, cpu) = stake_weights(data)?;
        let delband = json!({
            "from": data.get("from"),
            "to": data.get("to"),
            "net_weight": net,
            "cpu_weight": cpu,
            "total_weight": round4(net + cpu),
        });
        delta.data = Value::Null;
        delta.enrichment.insert("@delband".to_string(), delband);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(code: &str, table: &str, data: Value) -> TableDelta {
        TableDelta {
            timestamp: "2020-01-01T00:00:00.000".to_string(),
            code: code.to_string(),
            scope: "alice".to_string(),
            table: table.to_string(),
            primary_key: "5459781".to_string(),
            payer: "alice".to_string(),
            present: true,
            block_num: 42,
            block_id: "2a".to_string(),
            data,
            ds_error: false,
            enrichment: Default::default(),
        }
    }

    #[test]
    fn token_balances_become_state_rows() {
        let mut balance = delta("eosio.token", "accounts", json!({"balance": "10.0000 EOS"}));
        let row = TokenAccountsHandler::new(true).handle(&mut balance).unwrap();
        assert_eq!(row.key, "eosio.token-alice-EOS");
        assert_eq!(row.block_num, 42);
        assert_eq!(row.data["amount"], 10.0);
        assert_eq!(balance.enrichment["@accounts"]["symbol"], "EOS");
        assert!(balance.data.get("balance").is_none());
    }

    #[test]
    fn non_token_accounts_tables_are_skipped() {
        let mut other = delta("game", "accounts", json!({"level": 3}));
        assert!(TokenAccountsHandler::new(true).handle(&mut other).is_none());
        assert!(other.enrichment.is_empty());
    }

    #[test]
    fn voters_are_keyed_by_owner() {
        let mut vote = delta(
            "eosio",
            "voters",
            json!({
                "owner": "bob",
                "proxy": "",
                "producers": ["bp1"],
                "staked": 100000,
                "last_vote_weight": "1234.5",
                "proxied_vote_weight": "0.0",
                "is_proxy": 0
            }),
        );
        let row = VotersHandler::new("eosio", true).handle(&mut vote).unwrap();
        assert_eq!(row.key, "bob");
        assert_eq!(row.data["last_vote_weight"], 1234.5);
        assert_eq!(row.data["staked"], 100000.0);
        assert!(row.data.get("proxy").is_none());
        assert_eq!(vote.enrichment["@voters"]["producers"], json!(["bp1"]));
    }

    #[test]
    fn stake_tables_sum_weights() {
        let mut band = delta(
            "eosio",
            "delband",
            json!({"from": "alice", "to": "bob", "net_weight": "1.1000 EOS", "cpu_weight": "2.2000 EOS"}),
        );
        assert!(DelbandHandler::new("eosio").handle(&mut band).is_none());
        assert_eq!(band.enrichment["@delband"]["total_weight"], 3.3);
        assert!(band.data.is_null());
    }
}
