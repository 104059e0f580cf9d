// Configuration built from environment variables only.
// Not present environment variables fall back to the defaults of each section.
// See configuration/example.config.toml for the meaning of every parameter.

pub const DEFAULT_CONFIG: &str = r#"
[general]
chain = "${CHAIN}"
chain_id = "${CHAIN_ID}"
eosio_alias = "${EOSIO_ALIAS}"
chain_api = "${CHAIN_API_URL}"
server_port = "${SERVER_PORT}"
max_ws_payload_mb = "${MAX_WS_PAYLOAD_MB}"
data_dir = "${DATA_DIR}"

[[ship]]
url = "${SHIP_URL}"
label = "${SHIP_LABEL}"

[[ship]]
url = "${SHIP_URL_2}"
label = "${SHIP_LABEL_2}"

[scaling]
readers = "${READERS}"
batch_size = "${BATCH_SIZE}"
ds_queues = "${DS_QUEUES}"
ds_threads = "${DS_THREADS}"
indexing_queues = "${INDEXING_QUEUES}"
ad_idx_queues = "${AD_IDX_QUEUES}"
dyn_idx_queues = "${DYN_IDX_QUEUES}"
max_autoscale = "${MAX_AUTOSCALE}"
auto_scale_trigger = "${AUTO_SCALE_TRIGGER}"
max_queue_limit = "${MAX_QUEUE_LIMIT}"
block_queue_limit = "${BLOCK_QUEUE_LIMIT}"
resume_trigger = "${RESUME_TRIGGER}"
polling_interval = "${POLLING_INTERVAL}"

[indexer]
start_on = "${START_ON}"
stop_on = "${STOP_ON}"
rewrite = "${REWRITE}"
purge_queues = "${PURGE_QUEUES}"
live_reader = "${LIVE_READER}"
live_only_mode = "${LIVE_ONLY_MODE}"
abi_scan_mode = "${ABI_SCAN_MODE}"
fetch_block = "${FETCH_BLOCK}"
fetch_traces = "${FETCH_TRACES}"
fetch_deltas = "${FETCH_DELTAS}"
process_deltas = "${PROCESS_DELTAS}"
disable_reading = "${DISABLE_READING}"
disable_indexing = "${DISABLE_INDEXING}"
auto_mode_switch = "${AUTO_MODE_SWITCH}"
max_inline = "${MAX_INLINE}"
auto_stop = "${AUTO_STOP}"

[prefetch]
read = "${PREFETCH_READ}"
block = "${PREFETCH_BLOCK}"
index = "${PREFETCH_INDEX}"

[filters]
action_blacklist = "${ACTION_BLACKLIST}"
action_whitelist = "${ACTION_WHITELIST}"
delta_blacklist = "${DELTA_BLACKLIST}"
delta_whitelist = "${DELTA_WHITELIST}"
root_only = "${ROOT_ONLY}"

[features]
index_transfer_memo = "${INDEX_TRANSFER_MEMO}"
index_deltas = "${INDEX_DELTAS}"
failed_trx = "${FAILED_TRX}"

[features.tables]
accounts = "${TABLES_ACCOUNTS}"
voters = "${TABLES_VOTERS}"

[broker]
backend = "${BROKER_BACKEND}"
redis_url = "${REDIS_URL}"
management_url = "${BROKER_MANAGEMENT_URL}"
vhost = "${BROKER_VHOST}"
user = "${BROKER_USER}"
pass = "${BROKER_PASS}"

[storage]
backend = "${STORAGE_BACKEND}"
url = "${STORAGE_URL}"
user = "${STORAGE_USER}"
pass = "${STORAGE_PASS}"
index_prefix = "${INDEX_PREFIX}"
max_retry = "${STORAGE_MAX_RETRY}"
"#;
