use tokio_retry::Retry;

use ship_primitives::IndexRecord;

use crate::base::indexer::{bulk_operations, merge_statuses};
use crate::base::BulkItemStatus;
use crate::elasticsearch::{bulk_body, item_status, ElasticsearchDbManager};

#[async_trait::async_trait]
impl crate::IndexerDbManager for ElasticsearchDbManager {
    #[cfg_attr(
        feature = "tracing-instrumentation",
        tracing::instrument(skip_all, fields(records = records.len()))
    )]
    async fn bulk_write(&self, records: &[IndexRecord]) -> anyhow::Result<Vec<BulkItemStatus>> {
        let operations = bulk_operations(&self.index_prefix, records)?;
        if operations.is_empty() {
            return Ok(vec![]);
        }
        let body = bulk_body(&operations)?;

        let response = Retry::start(self.retry_strategy(), || async {
            self.send_bulk(&body).await.map_err(|err| {
                tracing::warn!(
                    target: crate::DATABASE,
                    "Failed to send bulk request of {} operations: {}",
                    operations.len(),
                    err
                );
                err
            })
        })
        .await?;

        if response.items.len() != operations.len() {
            anyhow::bail!(
                "Bulk response has {} items for {} operations",
                response.items.len(),
                operations.len()
            );
        }
        if response.errors {
            tracing::debug!(
                target: crate::DATABASE,
                "Bulk request reported item errors"
            );
        }

        let outcomes = response
            .items
            .into_iter()
            .zip(&operations)
            .map(|(item, operation)| match item.into_values().next() {
                Some(item) => {
                    let status = item_status(item, operation);
                    if let BulkItemStatus::Failed(reason) = &status {
                        crate::metrics::BULK_ITEM_FAILURES
                            .with_label_values(&[&operation.index])
                            .inc();
                        tracing::warn!(
                            target: crate::DATABASE,
                            "Bulk item {}/{} failed: {}",
                            operation.index,
                            operation.id,
                            reason
                        );
                    }
                    status
                }
                None => BulkItemStatus::Failed("empty bulk response item".to_string()),
            })
            .collect();
        Ok(merge_statuses(records.len(), &operations, outcomes))
    }
}
