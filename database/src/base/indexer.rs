use ship_primitives::IndexRecord;

use crate::base::{contract_state_index, index_name, BulkItemStatus};

#[async_trait::async_trait]
pub trait IndexerDbManager: Send + Sync {
    /// Writes a batch in one request. The result holds one status per record,
    /// in input order. An `Err` means nothing is known about the batch.
    async fn bulk_write(&self, records: &[IndexRecord]) -> anyhow::Result<Vec<BulkItemStatus>>;
}

/// A single document write derived from a record. Deltas produce two: the
/// audit document and the live contract row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BulkOperation {
    /// Position of the originating record in the batch.
    pub record: usize,
    pub index: String,
    pub id: String,
    /// External version; older versions never overwrite newer ones.
    pub version: Option<u32>,
    pub document: serde_json::Value,
}

pub(crate) fn bulk_operations(
    index_prefix: &str,
    records: &[IndexRecord],
) -> anyhow::Result<Vec<BulkOperation>> {
    let mut operations = Vec::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        let index = index_name(index_prefix, record.kind());
        let id = record.document_id();
        let (version, document) = match record {
            IndexRecord::Block(block) => (None, serde_json::to_value(block)?),
            IndexRecord::Action(action) => (None, serde_json::to_value(action)?),
            IndexRecord::Delta(delta) => {
                operations.push(BulkOperation {
                    record: position,
                    index: contract_state_index(index_prefix),
                    id: delta.row_key(),
                    version: Some(delta.block_num),
                    document: serde_json::json!({
                        "@timestamp": delta.timestamp,
                        "code": delta.code,
                        "scope": delta.scope,
                        "table": delta.table,
                        "primary_key": delta.primary_key,
                        "payer": delta.payer,
                        "block_num": delta.block_num,
                        "present": delta.present,
                        "data": if delta.present { delta.data.clone() } else { serde_json::Value::Null },
                    }),
                });
                (None, serde_json::to_value(delta)?)
            }
            IndexRecord::Abi(abi) => (None, serde_json::to_value(abi)?),
            IndexRecord::TableState(row) => (Some(row.block_num), serde_json::to_value(row)?),
            IndexRecord::TrxError(trx) => (None, serde_json::to_value(trx)?),
        };
        operations.push(BulkOperation {
            record: position,
            index,
            id,
            version,
            document,
        });
    }
    Ok(operations)
}

/// Folds per-operation outcomes into one status per record. Any failed
/// operation fails its record; a stale operation only marks it stale.
pub(crate) fn merge_statuses(
    record_count: usize,
    operations: &[BulkOperation],
    outcomes: Vec<BulkItemStatus>,
) -> Vec<BulkItemStatus> {
    let mut statuses = vec![BulkItemStatus::Written; record_count];
    for (operation, outcome) in operations.iter().zip(outcomes) {
        let status = &mut statuses[operation.record];
        match (&*status, outcome) {
            (BulkItemStatus::Failed(_), _) => {}
            (_, BulkItemStatus::Failed(reason)) => *status = BulkItemStatus::Failed(reason),
            (BulkItemStatus::Written, BulkItemStatus::Stale) => *status = BulkItemStatus::Stale,
            _ => {}
        }
    }
    statuses
}
