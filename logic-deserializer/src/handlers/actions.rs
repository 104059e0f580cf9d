use serde_json::{json, Map, Value};
use ship_primitives::ActionTrace;

use super::{split_asset, ActionHandler, ANY};

fn data_object(action: &mut ActionTrace) -> Option<&mut Map<String, Value>> {
    action.act.data.as_object_mut()
}

fn asset_amount(data: &Map<String, Value>, field: &str) -> Option<f64> {
    data.get(field).and_then(split_asset).map(|(amount, _)| amount)
}

/// Token transfers on any contract: `@transfer {from, to, amount, symbol}`.
pub struct TransferHandler {
    index_memo: bool,
}

impl TransferHandler {
    pub fn new(index_memo: bool) -> Self {
        Self { index_memo }
    }
}

impl ActionHandler for TransferHandler {
    fn contract(&self) -> &str {
        ANY
    }

    fn action(&self) -> &str {
        "transfer"
    }

    fn handle(&self, action: &mut ActionTrace) {
        let index_memo = self.index_memo;
        let Some(data) = data_object(action) else {
            return;
        };
        let quantity = data
            .get("quantity")
            .and_then(split_asset)
            .or_else(|| data.get("value").and_then(split_asset));
        let Some((amount, symbol)) = quantity else {
            return;
        };
        let mut transfer = json!({
            "from": data.remove("from").unwrap_or(Value::Null),
            "to": data.remove("to").unwrap_or(Value::Null),
            "amount": amount,
            "symbol": symbol,
        });
        if index_memo {
            transfer["memo"] = data.remove("memo").unwrap_or(Value::Null);
        }
        action.enrichment.insert("@transfer".to_string(), transfer);
    }
}

/// Handler bound to the system contract account.
macro_rules! system_handler {
    ($name:ident) => {
        pub struct $name {
            system: String,
        }

        impl $name {
            pub fn new(eosio_alias: &str) -> Self {
                Self {
                    system: eosio_alias.to_string(),
                }
            }
        }
    };
}

system_handler!(DelegateBwHandler);
system_handler!(UndelegateBwHandler);
system_handler!(NewAccountHandler);
system_handler!(VoteProducerHandler);
system_handler!(UnstakeToRexHandler);

impl ActionHandler for DelegateBwHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn action(&self) -> &str {
        "delegatebw"
    }

    fn handle(&self, action: &mut ActionTrace) {
        let Some(data) = data_object(action) else {
            return;
        };
        let cpu = asset_amount(data, "stake_cpu_quantity").unwrap_or_default();
        let net = asset_amount(data, "stake_net_quantity").unwrap_or_default();
        let stake = json!({
            "amount": cpu + net,
            "stake_cpu_quantity": cpu,
            "stake_net_quantity": net,
            "from": data.get("from"),
            "receiver": data.get("receiver"),
            "transfer": data.get("transfer"),
        });
        action.act.data = Value::Null;
        action.enrichment.insert("@delegatebw".to_string(), stake);
    }
}

impl ActionHandler for UndelegateBwHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn action(&self) -> &str {
        "undelegatebw"
    }

    fn handle(&self, action: &mut ActionTrace) {
        let Some(data) = data_object(action) else {
            return;
        };
        let cpu = asset_amount(data, "unstake_cpu_quantity").unwrap_or_default();
        let net = asset_amount(data, "unstake_net_quantity").unwrap_or_default();
        let unstake = json!({
            "amount": cpu + net,
            "unstake_cpu_quantity": cpu,
            "unstake_net_quantity": net,
            "from": data.get("from"),
            "receiver": data.get("receiver"),
        });
        action.act.data = Value::Null;
        action.enrichment.insert("@undelegatebw".to_string(), unstake);
    }
}

impl ActionHandler for NewAccountHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn action(&self) -> &str {
        "newaccount"
    }

    fn handle(&self, action: &mut ActionTrace) {
        let Some(data) = data_object(action) else {
            return;
        };
        // older system contracts call the field `name`
        let name = match data.get("newact") {
            Some(name) => Some(name.clone()),
            None => data.remove("name"),
        };
        let Some(name) = name else {
            return;
        };
        let created = json!({
            "active": data.get("active"),
            "owner": data.get("owner"),
            "newact": name,
        });
        action.enrichment.insert("@newaccount".to_string(), created);
    }
}

impl ActionHandler for VoteProducerHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn action(&self) -> &str {
        "voteproducer"
    }

    fn handle(&self, action: &mut ActionTrace) {
        let Some(data) = data_object(action) else {
            return;
        };
        let vote = json!({
            "proxy": data.get("proxy"),
            "producers": data.get("producers"),
        });
        action.enrichment.insert("@voteproducer".to_string(), vote);
    }
}

impl ActionHandler for UnstakeToRexHandler {
    fn contract(&self) -> &str {
        &self.system
    }

    fn action(&self) -> &str {
        "unstaketorex"
    }

    fn handle(&self, action: &mut ActionTrace) {
        let Some(data) = data_object(action) else {
            return;
        };
        let cpu = asset_amount(data, "from_cpu").unwrap_or_default();
        let net = asset_amount(data, "from_net").unwrap_or_default();
        let unstake = json!({
            "amount": cpu + net,
            "owner": data.get("owner"),
            "receiver": data.get("receiver"),
        });
        action.enrichment.insert("@unstaketorex".to_string(), unstake);
    }
}
