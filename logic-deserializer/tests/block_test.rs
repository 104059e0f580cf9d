use std::sync::Arc;

use abi_codec::{Abi, AbiDef};
use logic_deserializer::{AbiCache, AbiSourceChain, BlockDeserializer, DeserializerSettings};
use serde_json::{json, Value};
use ship_client::ShipProtocol;
use ship_primitives::{AbiUpdate, ActionTrace, IndexRecord, RecordKind};

const SHIP_ABI: &str = include_str!("fixtures/ship_abi.json");

const TOKEN_ABI: &str = r#"{
    "version": "eosio::abi/1.1",
    "structs": [
        {"name": "transfer", "base": "", "fields": [
            {"name": "from", "type": "name"},
            {"name": "to", "type": "name"},
            {"name": "quantity", "type": "asset"},
            {"name": "memo", "type": "string"}
        ]},
        {"name": "issue", "base": "", "fields": [
            {"name": "to", "type": "name"},
            {"name": "quantity", "type": "asset"}
        ]},
        {"name": "account", "base": "", "fields": [{"name": "balance", "type": "asset"}]}
    ],
    "actions": [
        {"name": "transfer", "type": "transfer", "ricardian_contract": ""},
        {"name": "issue", "type": "issue", "ricardian_contract": ""}
    ],
    "tables": [
        {"name": "accounts", "index_type": "i64", "key_names": [], "key_types": [], "type": "account"}
    ]
}"#;

const TIMESTAMP: &str = "2020-01-01T00:00:00.000";

fn id(byte: u8) -> String {
    hex::encode([byte; 32])
}

fn token_abi() -> Abi {
    Abi::from_json(TOKEN_ABI).unwrap()
}

fn token_abi_hex() -> String {
    hex::encode(AbiDef::from_json(TOKEN_ABI).unwrap().to_bytes().unwrap())
}

/// Token ABI after a contract update that dropped `transfer`.
fn issue_only_abi_hex() -> String {
    let mut def = AbiDef::from_json(TOKEN_ABI).unwrap();
    def.actions.retain(|action| action.name == "issue");
    hex::encode(def.to_bytes().unwrap())
}

fn transfer_data(from: &str, to: &str, quantity: &str) -> String {
    let data = token_abi()
        .encode(
            "transfer",
            &json!({"from": from, "to": to, "quantity": quantity, "memo": "hi"}),
        )
        .unwrap();
    hex::encode(data)
}

fn settings() -> DeserializerSettings {
    DeserializerSettings {
        chain: "wax".to_string(),
        eosio_alias: "eosio".to_string(),
        chain_id: None,
        indexer: configuration::IndexerConfig {
            start_on: 0,
            stop_on: 0,
            rewrite: false,
            purge_queues: false,
            live_reader: false,
            live_only_mode: false,
            abi_scan_mode: false,
            fetch_block: true,
            fetch_traces: true,
            fetch_deltas: true,
            process_deltas: true,
            disable_reading: false,
            disable_indexing: false,
            auto_mode_switch: false,
            max_inline: None,
            auto_stop: 0,
        },
        features: configuration::FeaturesConfig {
            accounts_table: true,
            voters_table: true,
            index_transfer_memo: false,
            index_deltas: true,
            failed_trx: true,
        },
        filters: Default::default(),
    }
}

fn deserializer(settings: DeserializerSettings) -> BlockDeserializer {
    let protocol = Arc::new(ShipProtocol::from_json(SHIP_ABI).unwrap());
    BlockDeserializer::new(protocol, settings, AbiCache::new(AbiSourceChain::new()))
}

struct TestAction {
    ordinal: u32,
    creator: u32,
    receiver: &'static str,
    account: &'static str,
    name: &'static str,
    data: String,
    global_sequence: u64,
    digest: u8,
}

impl TestAction {
    fn root(account: &'static str, name: &'static str, data: String, global_sequence: u64) -> Self {
        Self {
            ordinal: 1,
            creator: 0,
            receiver: account,
            account,
            name,
            data,
            global_sequence,
            digest: global_sequence as u8,
        }
    }

    fn to_json(&self) -> Value {
        json!(["action_trace_v1", {
            "action_ordinal": self.ordinal,
            "creator_action_ordinal": self.creator,
            "receipt": ["action_receipt_v0", {
                "receiver": self.receiver,
                "act_digest": id(self.digest),
                "global_sequence": self.global_sequence,
                "recv_sequence": 1,
                "auth_sequence": [{"account": "alice", "sequence": 1}],
                "code_sequence": 1,
                "abi_sequence": 1
            }],
            "receiver": self.receiver,
            "act": {
                "account": self.account,
                "name": self.name,
                "authorization": [{"actor": "alice", "permission": "active"}],
                "data": self.data
            },
            "context_free": false,
            "elapsed": 10,
            "console": "",
            "account_ram_deltas": [],
            "except": null,
            "error_code": null,
            "return_value": ""
        }])
    }
}

struct BlockBuilder {
    protocol: ShipProtocol,
    block_num: u32,
    with_block: bool,
    receipts: Vec<Value>,
    traces: Vec<Value>,
    deltas: Vec<Value>,
}

impl BlockBuilder {
    fn new(block_num: u32) -> Self {
        Self {
            protocol: ShipProtocol::from_json(SHIP_ABI).unwrap(),
            block_num,
            with_block: true,
            receipts: vec![],
            traces: vec![],
            deltas: vec![],
        }
    }

    fn without_block(mut self) -> Self {
        self.with_block = false;
        self
    }

    fn transaction(mut self, trx: u8, actions: Vec<TestAction>) -> Self {
        self.receipts.push(json!({
            "status": 0,
            "cpu_usage_us": 100,
            "net_usage_words": 12,
            "trx": ["transaction_id", id(trx)]
        }));
        self.traces.push(json!(["transaction_trace_v0", {
            "id": id(trx),
            "status": 0,
            "cpu_usage_us": 100,
            "net_usage_words": 12,
            "elapsed": 50,
            "net_usage": 96,
            "scheduled": false,
            "action_traces": actions.iter().map(TestAction::to_json).collect::<Vec<_>>(),
            "account_ram_delta": null,
            "except": null,
            "error_code": null,
            "failed_dtrx_trace": null,
            "partial": null
        }]));
        self
    }

    fn failed_transaction(mut self, trx: u8, status: u8) -> Self {
        self.receipts.push(json!({
            "status": status,
            "cpu_usage_us": 0,
            "net_usage_words": 0,
            "trx": ["transaction_id", id(trx)]
        }));
        self
    }

    fn abi(mut self, account: &str, abi_hex: String) -> Self {
        let row = self
            .protocol
            .abi()
            .encode(
                "account",
                &json!(["account_v0", {"name": account, "creation_date": TIMESTAMP, "abi": abi_hex}]),
            )
            .unwrap();
        self.deltas.push(json!(["table_delta_v0", {
            "name": "account",
            "rows": [{"present": true, "data": hex::encode(row)}]
        }]));
        self
    }

    fn balance(mut self, code: &str, scope: &str, balance: &str, present: bool) -> Self {
        let value = token_abi()
            .encode("account", &json!({"balance": balance}))
            .unwrap();
        let row = self
            .protocol
            .abi()
            .encode(
                "contract_row",
                &json!(["contract_row_v0", {
                    "code": code,
                    "scope": scope,
                    "table": "accounts",
                    "primary_key": 5459781,
                    "payer": scope,
                    "value": hex::encode(value)
                }]),
            )
            .unwrap();
        self.deltas.push(json!(["table_delta_v0", {
            "name": "contract_row",
            "rows": [{"present": present, "data": hex::encode(row)}]
        }]));
        self
    }

    fn frame(self) -> Vec<u8> {
        let abi = self.protocol.abi();
        let block = self.with_block.then(|| {
            let signed_block = abi
                .encode(
                    "signed_block",
                    &json!({
                        "timestamp": TIMESTAMP,
                        "producer": "producer1",
                        "confirmed": 0,
                        "previous": id(1),
                        "transaction_mroot": id(0),
                        "action_mroot": id(0),
                        "schedule_version": 3,
                        "new_producers": null,
                        "header_extensions": [],
                        "producer_signature": format!("SIG_K1_{}", hex::encode([7u8; 65])),
                        "transactions": self.receipts,
                        "block_extensions": []
                    }),
                )
                .unwrap();
            hex::encode(signed_block)
        });
        let traces = abi
            .encode("transaction_trace[]", &Value::Array(self.traces))
            .unwrap();
        let deltas = abi
            .encode("table_delta[]", &Value::Array(self.deltas))
            .unwrap();
        abi.encode(
            "result",
            &json!(["get_blocks_result_v0", {
                "head": {"block_num": self.block_num + 10, "block_id": id(9)},
                "last_irreversible": {"block_num": self.block_num - 1, "block_id": id(8)},
                "this_block": {"block_num": self.block_num, "block_id": id(2)},
                "prev_block": {"block_num": self.block_num - 1, "block_id": id(1)},
                "block": block,
                "traces": hex::encode(traces),
                "deltas": hex::encode(deltas)
            }]),
        )
        .unwrap()
    }
}

fn actions(records: &[IndexRecord]) -> Vec<&ActionTrace> {
    records
        .iter()
        .filter_map(|record| match record {
            IndexRecord::Action(action) => Some(action),
            _ => None,
        })
        .collect()
}

fn count(records: &[IndexRecord], kind: RecordKind) -> usize {
    records.iter().filter(|record| record.kind() == kind).count()
}

#[tokio::test]
async fn block_with_abi_transfer_and_balance() {
    let deserializer = deserializer(settings());
    let mut notification = TestAction::root(
        "eosio.token",
        "transfer",
        transfer_data("alice", "bob", "1.0000 EOS"),
        1001,
    );
    notification.ordinal = 2;
    notification.creator = 1;
    notification.receiver = "bob";
    notification.digest = 233;
    let frame = BlockBuilder::new(100)
        .abi("eosio.token", token_abi_hex())
        .balance("eosio.token", "alice", "10.0000 EOS", true)
        .transaction(
            1,
            vec![
                TestAction {
                    digest: 233,
                    ..TestAction::root(
                        "eosio.token",
                        "transfer",
                        transfer_data("alice", "bob", "1.0000 EOS"),
                        1000,
                    )
                },
                notification,
            ],
        )
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    assert_eq!(block.block_num, 100);
    assert_eq!(block.producer, "producer1");
    assert_eq!(block.last_irreversible, 99);
    assert!(block.ds_errors.is_empty());
    assert_eq!(block.abi_updates.len(), 1);
    assert_eq!(block.abi_updates[0].account, "eosio.token");
    assert_eq!(block.actions, 1);
    assert_eq!(block.deltas, 1);

    let actions = actions(&block.records);
    assert_eq!(actions.len(), 1);
    let transfer = actions[0];
    assert_eq!(transfer.global_sequence, 1000);
    assert_eq!(transfer.receipts.len(), 2);
    assert_eq!(transfer.receipts[1].receiver, "bob");
    assert_eq!(transfer.enrichment["@transfer"]["amount"], 1.0);
    assert_eq!(transfer.enrichment["@transfer"]["from"], "alice");
    assert_eq!(transfer.cpu_usage_us, Some(100));
    assert_eq!(transfer.inline_count, Some(1));
    assert_eq!(transfer.timestamp, TIMESTAMP);

    assert_eq!(count(&block.records, RecordKind::Abi), 1);
    assert_eq!(count(&block.records, RecordKind::Delta), 1);
    let state_row = block
        .records
        .iter()
        .find_map(|record| match record {
            IndexRecord::TableState(row) => Some(row),
            _ => None,
        })
        .unwrap();
    assert_eq!(state_row.key, "eosio.token-alice-EOS");
    assert_eq!(state_row.data["amount"], 10.0);

    let Some(IndexRecord::Block(light_block)) = block.records.last() else {
        panic!("block record comes last");
    };
    assert_eq!(light_block.trx_count, 1);
    assert_eq!(light_block.cpu_usage, 100);
    assert_eq!(light_block.net_usage, 12);
    assert_eq!(light_block.prev_id, id(1));
    assert_eq!(light_block.schedule_version, 3);
}

#[tokio::test]
async fn previous_block_abi_decodes_actions_before_an_abi_change() {
    let deserializer = deserializer(settings());
    deserializer
        .apply_abi_update(&AbiUpdate {
            account: "eosio.token".to_string(),
            block_num: 50,
            abi_hex: token_abi_hex(),
        })
        .await
        .unwrap();
    let frame = BlockBuilder::new(100)
        .abi("eosio.token", issue_only_abi_hex())
        .transaction(
            1,
            vec![TestAction::root(
                "eosio.token",
                "transfer",
                transfer_data("alice", "bob", "2.0000 EOS"),
                1,
            )],
        )
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    let actions = actions(&block.records);
    assert!(!actions[0].ds_error);
    assert_eq!(actions[0].act.data["quantity"], "2.0000 EOS");
    assert_eq!(actions[0].enrichment["@transfer"]["amount"], 2.0);
    assert!(block.ds_errors.is_empty());
}

#[tokio::test]
async fn undecodable_actions_keep_hex_and_report() {
    let mut deserializer = deserializer(settings());
    deserializer.register_reinterpreter(
        "*",
        "claim",
        Box::new(|payload| Ok(json!({ "raw_len": payload.len() }))),
    );
    let frame = BlockBuilder::new(10)
        .transaction(
            1,
            vec![
                TestAction::root("game", "play", "0102".to_string(), 1),
                TestAction {
                    ordinal: 2,
                    ..TestAction::root("game", "claim", "aabbcc".to_string(), 2)
                },
            ],
        )
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    let actions = actions(&block.records);
    assert_eq!(actions.len(), 2);
    assert!(actions[0].ds_error);
    assert_eq!(actions[0].act.data, json!("0102"));
    assert!(!actions[1].ds_error);
    assert_eq!(actions[1].act.data, json!({"raw_len": 3}));

    assert_eq!(block.ds_errors.len(), 1);
    assert_eq!(block.ds_errors[0].type_name, "action_ds_error");
    assert_eq!(block.ds_errors[0].block_num, 10);
}

#[tokio::test]
async fn root_only_whitelist_without_matches_still_indexes_the_block() {
    let mut settings = settings();
    settings.filters.action_whitelist = vec!["wax::eosio.token::transfer".to_string()];
    settings.filters.root_only = Some(true);
    let deserializer = deserializer(settings);
    deserializer
        .apply_abi_update(&AbiUpdate {
            account: "eosio.token".to_string(),
            block_num: 1,
            abi_hex: token_abi_hex(),
        })
        .await
        .unwrap();
    let frame = BlockBuilder::new(20)
        .balance("eosio.token", "alice", "5.0000 EOS", true)
        .transaction(
            1,
            vec![TestAction::root("game", "play", "00".to_string(), 1)],
        )
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    assert_eq!(block.actions, 0);
    assert_eq!(block.deltas, 0);
    assert_eq!(count(&block.records, RecordKind::Block), 1);
    assert_eq!(block.records.len(), 1);
}

#[tokio::test]
async fn root_only_whitelist_keeps_inline_children() {
    let mut settings = settings();
    settings.filters.action_whitelist = vec!["eosio.token::transfer".to_string()];
    settings.filters.root_only = Some(true);
    let deserializer = deserializer(settings);
    deserializer
        .apply_abi_update(&AbiUpdate {
            account: "eosio.token".to_string(),
            block_num: 1,
            abi_hex: token_abi_hex(),
        })
        .await
        .unwrap();
    let frame = BlockBuilder::new(20)
        .transaction(
            1,
            vec![
                TestAction::root(
                    "eosio.token",
                    "transfer",
                    transfer_data("alice", "game", "1.0000 EOS"),
                    1,
                ),
                TestAction {
                    ordinal: 2,
                    creator: 1,
                    ..TestAction::root("game", "credit", "00".to_string(), 2)
                },
            ],
        )
        .transaction(
            2,
            vec![TestAction::root("game", "play", "00".to_string(), 3)],
        )
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    let actions = actions(&block.records);
    let names: Vec<&str> = actions.iter().map(|action| action.act.name.as_str()).collect();
    assert_eq!(names, vec!["transfer", "credit"]);
}

#[tokio::test]
async fn abi_scan_mode_only_collects_abis() {
    let mut settings = settings();
    settings.indexer.abi_scan_mode = true;
    let deserializer = deserializer(settings);
    let frame = BlockBuilder::new(30)
        .abi("eosio.token", token_abi_hex())
        .balance("eosio.token", "alice", "1.0000 EOS", true)
        .transaction(
            1,
            vec![TestAction::root(
                "eosio.token",
                "transfer",
                transfer_data("alice", "bob", "1.0000 EOS"),
                1,
            )],
        )
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    assert_eq!(block.records.len(), 1);
    let IndexRecord::Abi(abi) = &block.records[0] else {
        panic!("expected an abi record");
    };
    assert_eq!(abi.account, "eosio.token");
    assert_eq!(abi.block, 30);
    assert_eq!(abi.actions, vec!["transfer", "issue"]);
    assert_eq!(abi.tables, vec!["accounts"]);
    assert_eq!(deserializer.abi_cache().len().await, 1);
}

#[tokio::test]
async fn max_inline_truncates_large_transactions() {
    let mut settings = settings();
    settings.indexer.max_inline = Some(1);
    let deserializer = deserializer(settings);
    let frame = BlockBuilder::new(40)
        .transaction(
            1,
            (1..=3)
                .map(|n| TestAction {
                    ordinal: n as u32,
                    creator: (n - 1) as u32,
                    ..TestAction::root("game", "step", "00".to_string(), n)
                })
                .collect(),
        )
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    let actions = actions(&block.records);
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].inline_count, Some(2));
    assert!(actions[0].inline_filtered);
}

#[tokio::test]
async fn delta_blacklist_and_tombstones() {
    let mut settings = settings();
    settings.filters.delta_blacklist = vec!["wax::eosio.token::accounts".to_string()];
    let deserializer = deserializer(settings);
    deserializer
        .apply_abi_update(&AbiUpdate {
            account: "wax.token".to_string(),
            block_num: 1,
            abi_hex: token_abi_hex(),
        })
        .await
        .unwrap();
    let frame = BlockBuilder::new(50)
        .balance("eosio.token", "alice", "1.0000 EOS", true)
        .balance("wax.token", "bob", "3.0000 WAX", false)
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    let deltas: Vec<_> = block
        .records
        .iter()
        .filter_map(|record| match record {
            IndexRecord::Delta(delta) => Some(delta),
            _ => None,
        })
        .collect();
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].code, "wax.token");
    assert!(!deltas[0].present);
    assert_eq!(deltas[0].primary_key, "5459781");
    let state_rows: Vec<_> = block
        .records
        .iter()
        .filter_map(|record| match record {
            IndexRecord::TableState(row) => Some(row),
            _ => None,
        })
        .collect();
    assert_eq!(state_rows.len(), 1);
    assert!(!state_rows[0].present);
}

#[tokio::test]
async fn undecodable_delta_is_reported() {
    let deserializer = deserializer(settings());
    let frame = BlockBuilder::new(60)
        .balance("unknown", "alice", "1.0000 EOS", true)
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    assert_eq!(block.ds_errors.len(), 1);
    assert_eq!(block.ds_errors[0].type_name, "delta_ds_error");
    let delta = block
        .records
        .iter()
        .find_map(|record| match record {
            IndexRecord::Delta(delta) => Some(delta),
            _ => None,
        })
        .unwrap();
    assert!(delta.ds_error);
    assert!(delta.data.is_string());
}

#[tokio::test]
async fn failed_transactions_become_records() {
    let deserializer = deserializer(settings());
    let frame = BlockBuilder::new(70)
        .failed_transaction(5, 2)
        .failed_transaction(6, 3)
        .frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    let failed: Vec<_> = block
        .records
        .iter()
        .filter_map(|record| match record {
            IndexRecord::TrxError(trx) => Some(trx),
            _ => None,
        })
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].trx_id, id(5));
    assert_eq!(failed[0].status, 2);
}

#[tokio::test]
async fn missing_block_body_leaves_header_fields_empty() {
    let deserializer = deserializer(settings());
    let frame = BlockBuilder::new(80).without_block().frame();

    let block = deserializer.deserialize(&frame).await.unwrap().unwrap();
    assert_eq!(block.timestamp, "");
    let Some(IndexRecord::Block(light_block)) = block.records.last() else {
        panic!("expected a block record");
    };
    assert_eq!(light_block.prev_id, id(1));
    assert_eq!(light_block.trx_count, 0);
}

#[tokio::test]
async fn status_frames_are_not_blocks() {
    let deserializer = deserializer(settings());
    let protocol = ShipProtocol::from_json(SHIP_ABI).unwrap();
    let frame = protocol
        .abi()
        .encode(
            "result",
            &json!(["get_status_result_v0", {
                "head": {"block_num": 1, "block_id": id(1)},
                "last_irreversible": {"block_num": 1, "block_id": id(1)},
                "trace_begin_block": 1,
                "trace_end_block": 1,
                "chain_state_begin_block": 1,
                "chain_state_end_block": 1,
                "chain_id": id(0xab)
            }]),
        )
        .unwrap();
    assert!(deserializer.deserialize(&frame).await.unwrap().is_none());
}

#[tokio::test]
async fn empty_abi_updates_are_ignored() {
    let deserializer = deserializer(settings());
    let empty = AbiUpdate {
        account: "alice".to_string(),
        block_num: 5,
        abi_hex: String::new(),
    };
    assert!(!deserializer.apply_abi_update(&empty).await.unwrap());
    let update = AbiUpdate {
        abi_hex: token_abi_hex(),
        ..empty
    };
    assert!(deserializer.apply_abi_update(&update).await.unwrap());
    assert!(deserializer.abi_cache().at_block("alice", 5).await.is_some());
}
