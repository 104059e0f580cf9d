use serde::{Deserialize, Serialize};

/// Record families routed to their own indexing queues and storage indices.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Block,
    Action,
    Delta,
    Abi,
    TableState,
    TrxError,
}

impl RecordKind {
    pub const ALL: [RecordKind; 6] = [
        RecordKind::Block,
        RecordKind::Action,
        RecordKind::Delta,
        RecordKind::Abi,
        RecordKind::TableState,
        RecordKind::TrxError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Block => "block",
            RecordKind::Action => "action",
            RecordKind::Delta => "delta",
            RecordKind::Abi => "abi",
            RecordKind::TableState => "table_state",
            RecordKind::TrxError => "trx_error",
        }
    }

    /// Name fragment used in indexing queue names, e.g. `wax:index_actions:2`.
    pub fn queue_fragment(&self) -> &'static str {
        match self {
            RecordKind::Block => "index_blocks",
            RecordKind::Action => "index_actions",
            RecordKind::Delta => "index_deltas",
            RecordKind::Abi => "index_abis",
            RecordKind::TableState => "index_table_state",
            RecordKind::TrxError => "index_trx_error",
        }
    }

    pub fn from_queue_fragment(fragment: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.queue_fragment() == fragment)
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Invalid record kind: {}", s))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Block {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub block_num: u32,
    pub block_id: String,
    pub prev_id: String,
    pub producer: String,
    pub schedule_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_producers: Option<serde_json::Value>,
    pub cpu_usage: u64,
    pub net_usage: u64,
    pub trx_count: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PermissionLevel {
    pub actor: String,
    pub permission: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Act {
    pub account: String,
    pub name: String,
    pub authorization: Vec<PermissionLevel>,
    /// decoded object, or the hex payload when decoding failed
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccountAuthSequence {
    pub account: String,
    pub sequence: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ActionReceipt {
    pub receiver: String,
    pub global_sequence: u64,
    pub recv_sequence: u64,
    pub auth_sequence: Vec<AccountAuthSequence>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ActionTrace {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub global_sequence: u64,
    pub block_num: u32,
    pub block_id: String,
    pub producer: String,
    pub trx_id: String,
    pub action_ordinal: u32,
    pub creator_action_ordinal: u32,
    pub act: Act,
    pub receipts: Vec<ActionReceipt>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ds_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage_us: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_usage_words: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_count: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inline_filtered: bool,
    /// Derived fields added by enrichment handlers, keyed `@<action>`.
    #[serde(flatten)]
    pub enrichment: serde_json::Map<String, serde_json::Value>,
}

impl ActionTrace {
    pub fn is_root(&self) -> bool {
        self.creator_action_ordinal == 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TableDelta {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub code: String,
    pub scope: String,
    pub table: String,
    pub primary_key: String,
    pub payer: String,
    /// `false` marks a removed row
    pub present: bool,
    pub block_num: u32,
    pub block_id: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ds_error: bool,
    #[serde(flatten)]
    pub enrichment: serde_json::Map<String, serde_json::Value>,
}

impl TableDelta {
    /// Identity of the row this delta changes.
    pub fn row_key(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.code, self.table, self.scope, self.primary_key
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AbiRecord {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub block: u32,
    pub account: String,
    /// ABI definition as JSON text
    pub abi: String,
    pub abi_hex: String,
    pub actions: Vec<String>,
    pub tables: Vec<String>,
}

/// Present-state row such as a token balance or a vote record, keyed by its
/// natural identity so full resyncs overwrite instead of duplicating.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TableStateRow {
    pub table: String,
    pub key: String,
    pub block_num: u32,
    pub present: bool,
    pub data: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FailedTrx {
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub block_num: u32,
    pub trx_id: String,
    pub status: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum IndexRecord {
    Block(Block),
    Action(ActionTrace),
    Delta(TableDelta),
    Abi(AbiRecord),
    TableState(TableStateRow),
    TrxError(FailedTrx),
}

impl IndexRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            IndexRecord::Block(_) => RecordKind::Block,
            IndexRecord::Action(_) => RecordKind::Action,
            IndexRecord::Delta(_) => RecordKind::Delta,
            IndexRecord::Abi(_) => RecordKind::Abi,
            IndexRecord::TableState(_) => RecordKind::TableState,
            IndexRecord::TrxError(_) => RecordKind::TrxError,
        }
    }

    /// Storage identity used for idempotent upserts.
    pub fn document_id(&self) -> String {
        match self {
            IndexRecord::Block(block) => block.block_num.to_string(),
            IndexRecord::Action(action) => action.global_sequence.to_string(),
            IndexRecord::Delta(delta) => format!(
                "{}-{}-{}-{}-{}",
                delta.block_num, delta.code, delta.scope, delta.table, delta.primary_key
            ),
            IndexRecord::Abi(abi) => format!("{}-{}", abi.account, abi.block),
            IndexRecord::TableState(row) => format!("{}-{}", row.table, row.key),
            IndexRecord::TrxError(trx) => trx.trx_id.clone(),
        }
    }

    pub fn block_num(&self) -> u32 {
        match self {
            IndexRecord::Block(block) => block.block_num,
            IndexRecord::Action(action) => action.block_num,
            IndexRecord::Delta(delta) => delta.block_num,
            IndexRecord::Abi(abi) => abi.block,
            IndexRecord::TableState(row) => row.block_num,
            IndexRecord::TrxError(trx) => trx.block_num,
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(block_num: u32, present: bool) -> TableDelta {
        TableDelta {
            timestamp: "2020-01-01T00:00:00.000".to_string(),
            code: "eosio.token".to_string(),
            scope: "alice".to_string(),
            table: "accounts".to_string(),
            primary_key: "5459781".to_string(),
            payer: "alice".to_string(),
            present,
            block_num,
            block_id: "00".to_string(),
            data: serde_json::json!({"balance": "1.0000 EOS"}),
            ds_error: false,
            enrichment: Default::default(),
        }
    }

    #[test]
    fn delta_identity_keys() {
        let record = IndexRecord::Delta(delta(10, true));
        assert_eq!(record.document_id(), "10-eosio.token-alice-accounts-5459781");
        let IndexRecord::Delta(inner) = &record else {
            unreachable!()
        };
        assert_eq!(inner.row_key(), "eosio.token-accounts-alice-5459781");
    }

    #[test]
    fn enrichment_fields_are_flattened() {
        let mut action = ActionTrace {
            timestamp: "2020-01-01T00:00:00.000".to_string(),
            global_sequence: 99,
            block_num: 5,
            block_id: "ab".to_string(),
            producer: "bp".to_string(),
            trx_id: "cd".to_string(),
            action_ordinal: 1,
            creator_action_ordinal: 0,
            act: Act {
                account: "eosio.token".to_string(),
                name: "transfer".to_string(),
                authorization: vec![],
                data: serde_json::json!({}),
            },
            receipts: vec![],
            ds_error: false,
            cpu_usage_us: None,
            net_usage_words: None,
            inline_count: None,
            inline_filtered: false,
            enrichment: Default::default(),
        };
        action
            .enrichment
            .insert("@transfer".to_string(), serde_json::json!({"amount": 1.0}));
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["@transfer"]["amount"], 1.0);
        assert!(json.get("ds_error").is_none());

        let record = IndexRecord::Action(action);
        let decoded = IndexRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.document_id(), "99");
        assert_eq!(decoded.kind(), RecordKind::Action);
    }

    #[test]
    fn queue_fragments_resolve_back_to_kinds() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_queue_fragment(kind.queue_fragment()), Some(kind));
            assert_eq!(kind.as_str().parse::<RecordKind>().unwrap(), kind);
        }
    }
}
