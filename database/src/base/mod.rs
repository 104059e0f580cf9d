pub mod indexer;
pub use crate::base::indexer::IndexerDbManager;
pub mod reader;
pub use crate::base::reader::ReaderDbManager;

/// Outcome of a single record inside a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkItemStatus {
    Written,
    /// The stored version is newer than the record (replay of an older block).
    Stale,
    Failed(String),
}

impl BulkItemStatus {
    /// Written and stale items are both final; only failures need a retry.
    pub fn is_settled(&self) -> bool {
        !matches!(self, BulkItemStatus::Failed(_))
    }
}

#[async_trait::async_trait]
pub trait BaseDbManager {
    async fn new(config: &configuration::StorageConfig) -> anyhow::Result<Box<Self>>;
}

/// Everything the pipeline needs from a storage backend.
pub trait StorageDbManager: IndexerDbManager + ReaderDbManager {}

impl<T: IndexerDbManager + ReaderDbManager> StorageDbManager for T {}

pub(crate) fn index_name(prefix: &str, kind: ship_primitives::RecordKind) -> String {
    format!("{}-{}", prefix, kind.as_str())
}

/// Live contract rows driven by deltas.
pub(crate) fn contract_state_index(prefix: &str) -> String {
    format!("{}-contract_state", prefix)
}
