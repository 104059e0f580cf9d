use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use ship_primitives::{AbiRecord, IndexRecord, RecordKind};

use crate::base::indexer::{bulk_operations, merge_statuses, BulkOperation};
use crate::base::{contract_state_index, index_name, BulkItemStatus};

#[derive(Debug, Clone)]
struct StoredDocument {
    version: Option<u32>,
    body: serde_json::Value,
}

#[derive(Default)]
struct MemoryStore {
    indices: HashMap<String, BTreeMap<String, StoredDocument>>,
    fail_once: HashSet<String>,
    bulk_requests: usize,
}

/// Storage kept in process memory with the same versioning rules as the
/// HTTP backend. Removed contract rows keep their version as a tombstone.
#[derive(Clone)]
pub struct MemoryDbManager {
    index_prefix: String,
    store: Arc<Mutex<MemoryStore>>,
}

#[async_trait::async_trait]
impl crate::BaseDbManager for MemoryDbManager {
    async fn new(config: &configuration::StorageConfig) -> anyhow::Result<Box<Self>> {
        Ok(Box::new(Self::with_prefix(&config.index_prefix)))
    }
}

impl MemoryDbManager {
    pub fn with_prefix(index_prefix: &str) -> Self {
        Self {
            index_prefix: index_prefix.to_string(),
            store: Arc::new(Mutex::new(MemoryStore::default())),
        }
    }

    fn store(&self) -> MutexGuard<'_, MemoryStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn document(&self, kind: RecordKind, id: &str) -> Option<serde_json::Value> {
        self.store()
            .indices
            .get(&index_name(&self.index_prefix, kind))
            .and_then(|index| index.get(id))
            .map(|document| document.body.clone())
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.store()
            .indices
            .get(&index_name(&self.index_prefix, kind))
            .map_or(0, BTreeMap::len)
    }

    /// Current contract row, `None` when never written or removed.
    pub fn live_row(&self, row_key: &str) -> Option<serde_json::Value> {
        self.store()
            .indices
            .get(&contract_state_index(&self.index_prefix))
            .and_then(|index| index.get(row_key))
            .filter(|document| document.body["present"] == serde_json::Value::Bool(true))
            .map(|document| document.body.clone())
    }

    /// Version of a contract row, including removed ones.
    pub fn live_row_version(&self, row_key: &str) -> Option<u32> {
        self.store()
            .indices
            .get(&contract_state_index(&self.index_prefix))
            .and_then(|index| index.get(row_key))
            .and_then(|document| document.version)
    }

    /// Makes the next write of document `id` fail.
    pub fn fail_once(&self, id: impl Into<String>) {
        self.store().fail_once.insert(id.into());
    }

    pub fn bulk_requests(&self) -> usize {
        self.store().bulk_requests
    }

    fn apply(store: &mut MemoryStore, operation: &BulkOperation) -> BulkItemStatus {
        if store.fail_once.remove(&operation.id) {
            return BulkItemStatus::Failed(format!("rejected write of {}", operation.id));
        }
        let index = store.indices.entry(operation.index.clone()).or_default();
        if let (Some(version), Some(existing)) = (operation.version, index.get(&operation.id)) {
            if existing.version.is_some_and(|stored| stored >= version) {
                return BulkItemStatus::Stale;
            }
        }
        index.insert(
            operation.id.clone(),
            StoredDocument {
                version: operation.version,
                body: operation.document.clone(),
            },
        );
        BulkItemStatus::Written
    }
}

#[async_trait::async_trait]
impl crate::IndexerDbManager for MemoryDbManager {
    async fn bulk_write(&self, records: &[IndexRecord]) -> anyhow::Result<Vec<BulkItemStatus>> {
        let operations = bulk_operations(&self.index_prefix, records)?;
        let mut store = self.store();
        store.bulk_requests += 1;
        let outcomes = operations
            .iter()
            .map(|operation| Self::apply(&mut store, operation))
            .collect();
        Ok(merge_statuses(records.len(), &operations, outcomes))
    }
}

#[async_trait::async_trait]
impl crate::ReaderDbManager for MemoryDbManager {
    async fn get_last_indexed_block(&self) -> anyhow::Result<Option<u32>> {
        Ok(self
            .store()
            .indices
            .get(&index_name(&self.index_prefix, RecordKind::Block))
            .and_then(|index| {
                index
                    .values()
                    .filter_map(|document| document.body["block_num"].as_u64())
                    .max()
            })
            .map(|block_num| block_num as u32))
    }

    async fn get_abi_at_block(
        &self,
        account: &str,
        block_num: u32,
    ) -> anyhow::Result<Option<AbiRecord>> {
        let store = self.store();
        let Some(index) = store
            .indices
            .get(&index_name(&self.index_prefix, RecordKind::Abi))
        else {
            return Ok(None);
        };
        let mut candidates = index
            .values()
            .map(|document| serde_json::from_value::<AbiRecord>(document.body.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        candidates.retain(|abi| abi.account == account && abi.block <= block_num);
        Ok(candidates.into_iter().max_by_key(|abi| abi.block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IndexerDbManager, ReaderDbManager};
    use ship_primitives::{Act, ActionTrace, TableDelta};

    fn action(global_sequence: u64) -> IndexRecord {
        IndexRecord::Action(ActionTrace {
            timestamp: "2020-01-01T00:00:00.000".to_string(),
            global_sequence,
            block_num: 10,
            block_id: "0a".to_string(),
            producer: "eosio".to_string(),
            trx_id: "ab".to_string(),
            action_ordinal: 1,
            creator_action_ordinal: 0,
            act: Act {
                account: "eosio.token".to_string(),
                name: "transfer".to_string(),
                authorization: vec![],
                data: serde_json::json!({"memo": "hi"}),
            },
            receipts: vec![],
            ds_error: false,
            cpu_usage_us: None,
            net_usage_words: None,
            inline_count: None,
            inline_filtered: false,
            enrichment: Default::default(),
        })
    }

    fn delta(block_num: u32, present: bool) -> IndexRecord {
        IndexRecord::Delta(TableDelta {
            timestamp: "2020-01-01T00:00:00.000".to_string(),
            code: "eosio.token".to_string(),
            scope: "alice".to_string(),
            table: "accounts".to_string(),
            primary_key: "5459781".to_string(),
            payer: "alice".to_string(),
            present,
            block_num,
            block_id: format!("{:x}", block_num),
            data: serde_json::json!({"balance": format!("{}.0000 EOS", block_num)}),
            ds_error: false,
            enrichment: Default::default(),
        })
    }

    fn abi(block: u32) -> IndexRecord {
        IndexRecord::Abi(AbiRecord {
            timestamp: "2020-01-01T00:00:00.000".to_string(),
            block,
            account: "eosio.token".to_string(),
            abi: "{}".to_string(),
            abi_hex: String::new(),
            actions: vec![],
            tables: vec![],
        })
    }

    #[tokio::test]
    async fn redelivered_actions_are_stored_once() {
        let storage = MemoryDbManager::with_prefix("wax");
        storage.bulk_write(&[action(42)]).await.unwrap();
        let statuses = storage.bulk_write(&[action(42), action(43)]).await.unwrap();
        assert!(statuses.iter().all(BulkItemStatus::is_settled));
        assert_eq!(storage.count(RecordKind::Action), 2);
    }

    #[tokio::test]
    async fn tombstone_survives_out_of_order_redelivery() {
        let storage = MemoryDbManager::with_prefix("wax");
        let row_key = "eosio.token-accounts-alice-5459781";
        storage.bulk_write(&[delta(10, true)]).await.unwrap();
        storage.bulk_write(&[delta(12, false)]).await.unwrap();
        assert!(storage.live_row(row_key).is_none());

        let statuses = storage.bulk_write(&[delta(10, true)]).await.unwrap();
        assert_eq!(statuses, vec![BulkItemStatus::Stale]);
        assert!(storage.live_row(row_key).is_none());
        assert_eq!(storage.live_row_version(row_key), Some(12));
        // both deltas stay in the audit index
        assert_eq!(storage.count(RecordKind::Delta), 2);

        storage.bulk_write(&[delta(15, true)]).await.unwrap();
        let row = storage.live_row(row_key).unwrap();
        assert_eq!(row["data"]["balance"], "15.0000 EOS");
    }

    #[tokio::test]
    async fn injected_failures_hit_one_record() {
        let storage = MemoryDbManager::with_prefix("wax");
        storage.fail_once("43");
        let statuses = storage.bulk_write(&[action(42), action(43)]).await.unwrap();
        assert_eq!(statuses[0], BulkItemStatus::Written);
        assert!(!statuses[1].is_settled());
        let statuses = storage.bulk_write(&[action(43)]).await.unwrap();
        assert_eq!(statuses, vec![BulkItemStatus::Written]);
    }

    #[tokio::test]
    async fn abi_lookup_picks_latest_before_block() {
        let storage = MemoryDbManager::with_prefix("wax");
        storage.bulk_write(&[abi(100), abi(200)]).await.unwrap();
        let found = storage.get_abi_at_block("eosio.token", 150).await.unwrap();
        assert_eq!(found.map(|abi| abi.block), Some(100));
        assert!(storage
            .get_abi_at_block("eosio.token", 50)
            .await
            .unwrap()
            .is_none());
        assert_eq!(storage.get_last_indexed_block().await.unwrap(), None);
    }
}
