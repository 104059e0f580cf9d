use std::collections::HashMap;
use std::sync::Arc;

use abi_codec::{Abi, AbiDef};
use serde::Deserialize;
use serde_json::Value;
use ship_client::{ShipProtocol, ShipResult};
use ship_primitives::{
    AbiRecord, AbiUpdate, AccountAuthSequence, Act, ActionReceipt, ActionTrace, Block,
    DsErrorReport, FailedTrx, IndexRecord, PermissionLevel, RecordKind, TableDelta,
};

use crate::abi_cache::AbiCache;
use crate::filters::Filters;
use crate::handlers::HandlerRegistry;

/// Receipt statuses of transactions that did not execute.
const FAILED_TRX_STATUSES: [u8; 3] = [1, 2, 4];

pub const ACTION_DS_ERROR: &str = "action_ds_error";
pub const DELTA_DS_ERROR: &str = "delta_ds_error";

/// Custom decoder for an action payload the contract ABI cannot describe.
pub type Reinterpreter = Box<dyn Fn(&[u8]) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DeserializerSettings {
    pub chain: String,
    pub eosio_alias: String,
    pub chain_id: Option<String>,
    pub indexer: configuration::IndexerConfig,
    pub features: configuration::FeaturesConfig,
    pub filters: configuration::FiltersConfig,
}

impl From<&configuration::Config> for DeserializerSettings {
    fn from(config: &configuration::Config) -> Self {
        Self {
            chain: config.general.chain.clone(),
            eosio_alias: config.general.eosio_alias.clone(),
            chain_id: config.general.chain_id.clone(),
            indexer: config.indexer.clone(),
            features: config.features.clone(),
            filters: config.filters.clone(),
        }
    }
}

/// Everything one block produced.
#[derive(Debug, Clone, Default)]
pub struct DeserializedBlock {
    pub block_num: u32,
    pub block_id: String,
    pub producer: String,
    pub timestamp: String,
    pub last_irreversible: u32,
    pub records: Vec<IndexRecord>,
    pub abi_updates: Vec<AbiUpdate>,
    pub ds_errors: Vec<DsErrorReport>,
    pub actions: u64,
    pub deltas: u64,
}

#[derive(Deserialize, Debug)]
struct RawSignedBlock {
    timestamp: String,
    producer: String,
    previous: String,
    schedule_version: u32,
    #[serde(default)]
    new_producers: Option<Value>,
    #[serde(default)]
    transactions: Vec<RawTransactionReceipt>,
}

#[derive(Deserialize, Debug)]
struct RawTransactionReceipt {
    status: u8,
    cpu_usage_us: u32,
    net_usage_words: u32,
    /// `["transaction_id", id]` or `["packed_transaction", {...}]`
    trx: (String, Value),
}

#[derive(Deserialize, Debug)]
struct RawTransactionTrace {
    id: String,
    status: u8,
    cpu_usage_us: u32,
    net_usage_words: u32,
    action_traces: Vec<(String, RawActionTrace)>,
}

#[derive(Deserialize, Debug)]
struct RawActionTrace {
    action_ordinal: u32,
    creator_action_ordinal: u32,
    #[serde(default)]
    receipt: Option<(String, RawReceipt)>,
    act: RawAction,
}

#[derive(Deserialize, Debug)]
struct RawReceipt {
    receiver: String,
    act_digest: String,
    global_sequence: u64,
    recv_sequence: u64,
    auth_sequence: Vec<AccountAuthSequence>,
}

#[derive(Deserialize, Debug)]
struct RawAction {
    account: String,
    name: String,
    authorization: Vec<PermissionLevel>,
    data: String,
}

#[derive(Deserialize, Debug)]
struct RawTableDelta {
    name: String,
    rows: Vec<RawRow>,
}

#[derive(Deserialize, Debug)]
struct RawRow {
    present: bool,
    data: String,
}

#[derive(Deserialize, Debug)]
struct RawAccount {
    name: String,
    abi: String,
}

#[derive(Deserialize, Debug)]
struct RawContractRow {
    code: String,
    scope: String,
    table: String,
    primary_key: u64,
    payer: String,
    value: String,
}

/// Position of the block being processed, stamped on every record.
struct BlockContext {
    block_num: u32,
    block_id: String,
    producer: String,
    timestamp: String,
}

pub struct BlockDeserializer {
    protocol: Arc<ShipProtocol>,
    settings: DeserializerSettings,
    filters: Filters,
    handlers: HandlerRegistry,
    reinterpreters: HashMap<String, Reinterpreter>,
    abi_cache: AbiCache,
}

impl BlockDeserializer {
    pub fn new(
        protocol: Arc<ShipProtocol>,
        settings: DeserializerSettings,
        abi_cache: AbiCache,
    ) -> Self {
        let filters = Filters::new(&settings.chain, &settings.eosio_alias, &settings.filters);
        let handlers = HandlerRegistry::with_builtins(
            settings.chain_id.clone(),
            &settings.eosio_alias,
            &settings.features,
        );
        Self {
            protocol,
            settings,
            filters,
            handlers,
            reinterpreters: HashMap::new(),
            abi_cache,
        }
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    pub fn abi_cache(&self) -> &AbiCache {
        &self.abi_cache
    }

    /// `contract` may be `*` to match the action on any contract.
    pub fn register_reinterpreter(
        &mut self,
        contract: &str,
        action: &str,
        reinterpreter: Reinterpreter,
    ) {
        self.reinterpreters
            .insert(format!("{}::{}", contract, action), reinterpreter);
    }

    /// Installs an ABI saved by another deserializer. Empty ABIs are ignored.
    pub async fn apply_abi_update(&self, update: &AbiUpdate) -> anyhow::Result<bool> {
        if update.abi_hex.is_empty() {
            return Ok(false);
        }
        let abi = Abi::from_hex(&update.abi_hex)?;
        Ok(self
            .abi_cache
            .insert(&update.account, update.block_num, Arc::new(abi))
            .await)
    }

    /// Decodes one stage-1 frame. Frames that are not block results, or carry
    /// no block position, yield `None`. Malformed protocol payloads are
    /// errors; contract payloads that fail to decode are kept as hex.
    #[cfg_attr(
        feature = "tracing-instrumentation",
        tracing::instrument(skip_all)
    )]
    pub async fn deserialize(&self, frame: &[u8]) -> anyhow::Result<Option<DeserializedBlock>> {
        let ShipResult::Blocks(result) = self.protocol.decode_result(frame)? else {
            return Ok(None);
        };
        let Some(this_block) = result.this_block else {
            return Ok(None);
        };
        let protocol = self.protocol.abi();

        let signed_block = match result.block {
            Some(bytes) => Some(
                serde_json::from_value::<RawSignedBlock>(protocol.decode("signed_block", bytes)?)
                    .map_err(|err| {
                        anyhow::anyhow!("signed_block {} is malformed: {}", this_block.block_num, err)
                    })?,
            ),
            None => None,
        };
        let traces: Vec<RawTransactionTrace> = match result.traces {
            Some(bytes) if !self.settings.indexer.abi_scan_mode => {
                serde_json::from_value::<Vec<(String, RawTransactionTrace)>>(
                    protocol.decode("transaction_trace[]", bytes)?,
                )?
                .into_iter()
                .map(|(_, trace)| trace)
                .filter(|trace| trace.status == 0)
                .collect()
            }
            _ => vec![],
        };
        let deltas: Vec<RawTableDelta> = match result.deltas {
            Some(bytes) => serde_json::from_value::<Vec<(String, RawTableDelta)>>(
                protocol.decode("table_delta[]", bytes)?,
            )?
            .into_iter()
            .map(|(_, delta)| delta)
            .collect(),
            None => vec![],
        };

        let context = BlockContext {
            block_num: this_block.block_num,
            block_id: this_block.block_id.clone(),
            producer: signed_block
                .as_ref()
                .map(|block| block.producer.clone())
                .unwrap_or_default(),
            timestamp: signed_block
                .as_ref()
                .map(|block| block.timestamp.clone())
                .unwrap_or_default(),
        };
        let mut output = DeserializedBlock {
            block_num: context.block_num,
            block_id: context.block_id.clone(),
            producer: context.producer.clone(),
            timestamp: context.timestamp.clone(),
            last_irreversible: result.last_irreversible.block_num,
            ..Default::default()
        };

        let accepted = self.root_only_prescan(&traces);
        let block_matched = !self.root_filter() || accepted.iter().any(|accepted| *accepted);
        let contract_rows_wanted = !self.settings.indexer.abi_scan_mode
            && self.settings.indexer.process_deltas
            && block_matched;

        // deltas first, so ABIs set in this block decode its actions
        self.process_deltas(&context, deltas, contract_rows_wanted, &mut output)
            .await?;

        if self.settings.indexer.abi_scan_mode {
            return Ok(Some(self.finish(output)));
        }

        for (trace, accepted) in traces.into_iter().zip(accepted) {
            if accepted {
                self.process_transaction(&context, trace, &mut output)
                    .await?;
            }
        }

        if let Some(block) = &signed_block {
            if self.settings.features.failed_trx {
                self.collect_failed_transactions(&context, block, &mut output);
            }
        }

        let (cpu_usage, net_usage, trx_count) = signed_block
            .as_ref()
            .map(|block| {
                block
                    .transactions
                    .iter()
                    .fold((0u64, 0u64, 0u32), |(cpu, net, count), trx| {
                        (
                            cpu + u64::from(trx.cpu_usage_us),
                            net + u64::from(trx.net_usage_words),
                            count + u32::from(trx.status == 0),
                        )
                    })
            })
            .unwrap_or_default();
        let prev_id = signed_block
            .as_ref()
            .map(|block| block.previous.clone())
            .or_else(|| result.prev_block.as_ref().map(|prev| prev.block_id.clone()))
            .unwrap_or_default();
        output.records.push(IndexRecord::Block(Block {
            timestamp: context.timestamp.clone(),
            block_num: context.block_num,
            block_id: context.block_id.clone(),
            prev_id,
            producer: context.producer.clone(),
            schedule_version: signed_block
                .as_ref()
                .map(|block| block.schedule_version)
                .unwrap_or_default(),
            new_producers: signed_block
                .and_then(|block| block.new_producers)
                .filter(|producers| !producers.is_null()),
            cpu_usage,
            net_usage,
            trx_count,
        }));

        Ok(Some(self.finish(output)))
    }

    fn finish(&self, mut output: DeserializedBlock) -> DeserializedBlock {
        if self.settings.indexer.disable_indexing {
            output
                .records
                .retain(|record| record.kind() == RecordKind::Abi);
        }
        output
    }

    fn root_filter(&self) -> bool {
        self.filters.root_only() && self.filters.has_action_whitelist()
    }

    /// Per transaction, whether its actions are looked at. With a root-only
    /// whitelist a transaction passes when one of its root actions does.
    fn root_only_prescan(&self, traces: &[RawTransactionTrace]) -> Vec<bool> {
        if !self.root_filter() {
            return vec![true; traces.len()];
        }
        let accepted: Vec<bool> = traces
            .iter()
            .map(|trace| {
                trace.action_traces.iter().any(|(_, action)| {
                    action.creator_action_ordinal == 0
                        && self
                            .filters
                            .action_allowed(&action.act.account, &action.act.name)
                })
            })
            .collect();
        if !traces.is_empty() && !accepted.iter().any(|accepted| *accepted) {
            tracing::debug!(
                target: crate::DESERIALIZER,
                "block has no whitelisted root actions, skipping traces and contract rows"
            );
        }
        accepted
    }

    fn action_passes(&self, account: &str, name: &str) -> bool {
        if self.root_filter() {
            !self.filters.action_blacklisted(account, name)
        } else {
            self.filters.action_allowed(account, name)
        }
    }

    async fn process_transaction(
        &self,
        context: &BlockContext,
        trace: RawTransactionTrace,
        output: &mut DeserializedBlock,
    ) -> anyhow::Result<()> {
        let total = trace.action_traces.len();
        let mut action_traces: Vec<RawActionTrace> = trace
            .action_traces
            .into_iter()
            .map(|(_, action)| action)
            .collect();
        let mut filtered = false;
        if let Some(max_inline) = self.settings.indexer.max_inline {
            if action_traces.len() > max_inline {
                action_traces.truncate(max_inline);
                filtered = true;
            }
        }

        let mut actions: Vec<ActionTrace> = vec![];
        let mut by_digest: HashMap<String, usize> = HashMap::new();
        for raw in action_traces {
            if !self.action_passes(&raw.act.account, &raw.act.name) {
                filtered = true;
                continue;
            }
            let Some((_, receipt)) = raw.receipt else {
                continue;
            };
            let action_receipt = ActionReceipt {
                receiver: receipt.receiver,
                global_sequence: receipt.global_sequence,
                recv_sequence: receipt.recv_sequence,
                auth_sequence: receipt.auth_sequence,
            };
            // notifications repeat the action under another receiver
            if let Some(index) = by_digest.get(&receipt.act_digest) {
                actions[*index].receipts.push(action_receipt);
                continue;
            }

            let payload = hex::decode(&raw.act.data)?;
            let (data, ds_error) = self
                .decode_action(&raw.act.account, &raw.act.name, context.block_num, &payload)
                .await;
            let mut action = ActionTrace {
                timestamp: context.timestamp.clone(),
                global_sequence: receipt.global_sequence,
                block_num: context.block_num,
                block_id: context.block_id.clone(),
                producer: context.producer.clone(),
                trx_id: trace.id.clone(),
                action_ordinal: raw.action_ordinal,
                creator_action_ordinal: raw.creator_action_ordinal,
                act: Act {
                    account: raw.act.account,
                    name: raw.act.name,
                    authorization: raw.act.authorization,
                    data,
                },
                receipts: vec![action_receipt],
                ds_error: ds_error.is_some(),
                cpu_usage_us: None,
                net_usage_words: None,
                inline_count: None,
                inline_filtered: false,
                enrichment: Default::default(),
            };
            match ds_error {
                Some(report) => output.ds_errors.push(report),
                None => {
                    self.handlers.apply_action(&mut action);
                }
            }
            by_digest.insert(receipt.act_digest, actions.len());
            actions.push(action);
        }

        if let Some(first) = actions.first_mut() {
            first.cpu_usage_us = Some(trace.cpu_usage_us);
            first.net_usage_words = Some(trace.net_usage_words);
            first.inline_count = Some(total.saturating_sub(1) as u32);
            first.inline_filtered = filtered;
        }
        output.actions += actions.len() as u64;
        output
            .records
            .extend(actions.into_iter().map(IndexRecord::Action));
        Ok(())
    }

    /// ABI at the block, then a registered reinterpreter, then the ABI one
    /// block earlier. Anything else stays hex with an error report.
    async fn decode_action(
        &self,
        account: &str,
        name: &str,
        block_num: u32,
        payload: &[u8],
    ) -> (Value, Option<DsErrorReport>) {
        let mut last_error = match self.decode_with_abi_at(account, name, block_num, payload).await {
            Ok(value) => return (value, None),
            Err(err) => err,
        };

        let reinterpreter = self
            .reinterpreters
            .get(&format!("{}::{}", account, name))
            .or_else(|| self.reinterpreters.get(&format!("*::{}", name)));
        if let Some(reinterpreter) = reinterpreter {
            match reinterpreter(payload) {
                Ok(value) => return (value, None),
                Err(err) => last_error = err.to_string(),
            }
        }

        if block_num > 0 {
            match self
                .decode_with_abi_at(account, name, block_num - 1, payload)
                .await
            {
                Ok(value) => return (value, None),
                Err(err) => last_error = err,
            }
        }

        tracing::warn!(
            target: crate::DESERIALIZER,
            "failed to decode {}::{} at block {}: {}",
            account,
            name,
            block_num,
            last_error
        );
        (
            Value::String(hex::encode(payload)),
            Some(DsErrorReport {
                block_num,
                type_name: ACTION_DS_ERROR.to_string(),
                message: format!("{}::{}: {}", account, name, last_error),
            }),
        )
    }

    async fn decode_with_abi_at(
        &self,
        account: &str,
        name: &str,
        block_num: u32,
        payload: &[u8],
    ) -> Result<Value, String> {
        let abi = self
            .abi_cache
            .resolve(account, block_num, Some(name))
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("no ABI for {} at block {}", account, block_num))?;
        let type_name = abi
            .action_type(name)
            .ok_or_else(|| format!("ABI of {} has no action {}", account, name))?;
        abi.decode(type_name, payload).map_err(|err| err.to_string())
    }

    async fn process_deltas(
        &self,
        context: &BlockContext,
        deltas: Vec<RawTableDelta>,
        contract_rows_wanted: bool,
        output: &mut DeserializedBlock,
    ) -> anyhow::Result<()> {
        let protocol = self.protocol.abi();
        for delta in deltas {
            let is_account = delta.name == "account";
            if !is_account && !(delta.name == "contract_row" && contract_rows_wanted) {
                continue;
            }
            let Some(row_type) = self.protocol.table_type(&delta.name) else {
                continue;
            };
            for row in delta.rows {
                let bytes = hex::decode(&row.data)?;
                let decoded = protocol.decode(row_type, &bytes)?;
                if is_account {
                    let (_, account) = serde_json::from_value::<(String, RawAccount)>(decoded)?;
                    self.process_account(context, account, output).await;
                } else {
                    let (_, contract_row) =
                        serde_json::from_value::<(String, RawContractRow)>(decoded)?;
                    self.process_contract_row(context, row.present, contract_row, output)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn process_account(
        &self,
        context: &BlockContext,
        account: RawAccount,
        output: &mut DeserializedBlock,
    ) {
        if account.abi.is_empty() {
            return;
        }
        let parsed = hex::decode(&account.abi)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Ok(AbiDef::from_bytes(&bytes)?));
        let def = match parsed {
            Ok(def) => def,
            Err(err) => {
                tracing::warn!(
                    target: crate::DESERIALIZER,
                    "ABI of {} at block {} cannot be parsed: {}",
                    account.name,
                    context.block_num,
                    err
                );
                output.ds_errors.push(DsErrorReport {
                    block_num: context.block_num,
                    type_name: "abi_ds_error".to_string(),
                    message: format!("{}: {}", account.name, err),
                });
                return;
            }
        };
        let abi_json = match serde_json::to_string(&def) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(
                    target: crate::DESERIALIZER,
                    "ABI of {} is not serializable: {}",
                    account.name,
                    err
                );
                return;
            }
        };
        let record = AbiRecord {
            timestamp: context.timestamp.clone(),
            block: context.block_num,
            account: account.name.clone(),
            abi: abi_json,
            abi_hex: account.abi.clone(),
            actions: def.actions.iter().map(|action| action.name.clone()).collect(),
            tables: def.tables.iter().map(|table| table.name.clone()).collect(),
        };
        match Abi::new(def) {
            Ok(abi) => {
                self.abi_cache
                    .insert(&account.name, context.block_num, Arc::new(abi))
                    .await;
            }
            Err(err) => {
                self.abi_cache
                    .mark_failed(&account.name, context.block_num, err.to_string())
                    .await;
            }
        }
        tracing::info!(
            target: crate::DESERIALIZER,
            "new ABI for {} at block {}",
            account.name,
            context.block_num
        );
        output.records.push(IndexRecord::Abi(record));
        output.abi_updates.push(AbiUpdate {
            account: account.name,
            block_num: context.block_num,
            abi_hex: account.abi,
        });
    }

    async fn process_contract_row(
        &self,
        context: &BlockContext,
        present: bool,
        row: RawContractRow,
        output: &mut DeserializedBlock,
    ) -> anyhow::Result<()> {
        if !self.filters.delta_allowed(&row.code, &row.table) {
            return Ok(());
        }
        let payload = hex::decode(&row.value)?;
        let decoded = match self
            .abi_cache
            .resolve(&row.code, context.block_num, Some(&row.table))
            .await
        {
            Ok(Some(abi)) => match abi.table_type(&row.table) {
                Some(type_name) => abi.decode(type_name, &payload).map_err(|err| err.to_string()),
                None => Err(format!("ABI of {} has no table {}", row.code, row.table)),
            },
            Ok(None) => Err(format!("no ABI for {} at block {}", row.code, context.block_num)),
            Err(err) => Err(err.to_string()),
        };
        let (data, ds_error) = match decoded {
            Ok(data) => (data, false),
            Err(reason) => {
                output.ds_errors.push(DsErrorReport {
                    block_num: context.block_num,
                    type_name: DELTA_DS_ERROR.to_string(),
                    message: format!("{}::{}: {}", row.code, row.table, reason),
                });
                (Value::String(row.value.clone()), true)
            }
        };
        let mut delta = TableDelta {
            timestamp: context.timestamp.clone(),
            code: row.code,
            scope: row.scope,
            table: row.table,
            primary_key: row.primary_key.to_string(),
            payer: row.payer,
            present,
            block_num: context.block_num,
            block_id: context.block_id.clone(),
            data,
            ds_error,
            enrichment: Default::default(),
        };
        if !ds_error {
            if let Some(state_row) = self.handlers.apply_delta(&mut delta) {
                output.records.push(IndexRecord::TableState(state_row));
            }
        }
        output.deltas += 1;
        if self.settings.features.index_deltas {
            output.records.push(IndexRecord::Delta(delta));
        }
        Ok(())
    }

    fn collect_failed_transactions(
        &self,
        context: &BlockContext,
        block: &RawSignedBlock,
        output: &mut DeserializedBlock,
    ) {
        for receipt in &block.transactions {
            if !FAILED_TRX_STATUSES.contains(&receipt.status) {
                continue;
            }
            let (kind, value) = &receipt.trx;
            let Some(trx_id) = value.as_str().filter(|_| kind == "transaction_id") else {
                continue;
            };
            output.records.push(IndexRecord::TrxError(FailedTrx {
                timestamp: context.timestamp.clone(),
                block_num: context.block_num,
                trx_id: trx_id.to_string(),
                status: receipt.status,
            }));
        }
    }
}
