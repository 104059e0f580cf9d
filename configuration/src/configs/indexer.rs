use serde_derive::Deserialize;

use crate::configs::deserialize_optional_data_or_env;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub start_on: u64,
    /// Zero means follow the head.
    pub stop_on: u64,
    pub rewrite: bool,
    pub purge_queues: bool,
    pub live_reader: bool,
    pub live_only_mode: bool,
    pub abi_scan_mode: bool,
    pub fetch_block: bool,
    pub fetch_traces: bool,
    pub fetch_deltas: bool,
    pub process_deltas: bool,
    pub disable_reading: bool,
    pub disable_indexing: bool,
    pub auto_mode_switch: bool,
    pub max_inline: Option<usize>,
    /// Seconds of inactivity before exiting; zero disables.
    pub auto_stop: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonIndexerConfig {
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub start_on: Option<u64>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub stop_on: Option<u64>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub rewrite: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub purge_queues: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub live_reader: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub live_only_mode: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub abi_scan_mode: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub fetch_block: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub fetch_traces: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub fetch_deltas: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub process_deltas: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub disable_reading: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub disable_indexing: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub auto_mode_switch: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub max_inline: Option<usize>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub auto_stop: Option<u64>,
}

impl From<CommonIndexerConfig> for IndexerConfig {
    fn from(common_config: CommonIndexerConfig) -> Self {
        Self {
            start_on: common_config.start_on.unwrap_or_default(),
            stop_on: common_config.stop_on.unwrap_or_default(),
            rewrite: common_config.rewrite.unwrap_or_default(),
            purge_queues: common_config.purge_queues.unwrap_or(true),
            live_reader: common_config.live_reader.unwrap_or(true),
            live_only_mode: common_config.live_only_mode.unwrap_or_default(),
            abi_scan_mode: common_config.abi_scan_mode.unwrap_or_default(),
            fetch_block: common_config.fetch_block.unwrap_or(true),
            fetch_traces: common_config.fetch_traces.unwrap_or(true),
            fetch_deltas: common_config.fetch_deltas.unwrap_or(true),
            process_deltas: common_config.process_deltas.unwrap_or(true),
            disable_reading: common_config.disable_reading.unwrap_or_default(),
            disable_indexing: common_config.disable_indexing.unwrap_or_default(),
            auto_mode_switch: common_config.auto_mode_switch.unwrap_or_default(),
            max_inline: common_config.max_inline.filter(|n| *n > 0),
            auto_stop: common_config.auto_stop.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeaturesConfig {
    /// Token balances from `accounts` rows.
    pub accounts_table: bool,
    /// Producer votes from `voters` rows.
    pub voters_table: bool,
    pub index_transfer_memo: bool,
    pub index_deltas: bool,
    pub failed_trx: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonTablesConfig {
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub accounts: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub voters: Option<bool>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub(crate) struct CommonFeaturesConfig {
    #[serde(default)]
    pub tables: CommonTablesConfig,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub index_transfer_memo: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub index_deltas: Option<bool>,
    #[serde(deserialize_with = "deserialize_optional_data_or_env", default)]
    pub failed_trx: Option<bool>,
}

impl From<CommonFeaturesConfig> for FeaturesConfig {
    fn from(common_config: CommonFeaturesConfig) -> Self {
        Self {
            accounts_table: common_config.tables.accounts.unwrap_or(true),
            voters_table: common_config.tables.voters.unwrap_or(true),
            index_transfer_memo: common_config.index_transfer_memo.unwrap_or_default(),
            index_deltas: common_config.index_deltas.unwrap_or(true),
            failed_trx: common_config.failed_trx.unwrap_or_default(),
        }
    }
}
