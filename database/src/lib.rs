#[macro_use]
extern crate lazy_static;

use std::sync::Arc;

mod base;
mod metrics;

pub use crate::base::BaseDbManager;
pub use crate::base::BulkItemStatus;
pub use crate::base::IndexerDbManager;
pub use crate::base::ReaderDbManager;
pub use crate::base::StorageDbManager;

pub mod elasticsearch;
pub mod memorydb;

pub use elasticsearch::ElasticsearchDbManager;
pub use memorydb::MemoryDbManager;

pub(crate) const DATABASE: &str = "database";

pub async fn prepare_db_manager<T>(config: &configuration::StorageConfig) -> anyhow::Result<T>
where
    T: BaseDbManager + Send + Sync + 'static,
{
    Ok(*T::new(config).await?)
}

/// Storage backend selected by `storage.backend`.
pub async fn prepare_storage(
    config: &configuration::StorageConfig,
) -> anyhow::Result<Arc<dyn StorageDbManager>> {
    Ok(match config.backend {
        configuration::StorageBackend::Elasticsearch => {
            Arc::new(prepare_db_manager::<ElasticsearchDbManager>(config).await?)
        }
        configuration::StorageBackend::Memory => {
            Arc::new(prepare_db_manager::<MemoryDbManager>(config).await?)
        }
    })
}
