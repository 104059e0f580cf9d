//! Ingestor workers: batch records from one indexing queue into bulk writes.
use std::sync::Arc;
use std::time::Duration;

use database::StorageDbManager;
use queue_fabric::{Delivery, QueueConsumer, QueueFabric};
use ship_primitives::{IndexRecord, MasterCommand, WorkerEvent};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use super::{WorkerContext, WorkerEvents, WorkerResources};
use crate::metrics;

const BATCH_WINDOW: Duration = Duration::from_secs(1);
const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const BULK_RETRY_DELAY: Duration = Duration::from_secs(1);

enum Control {
    Continue,
    Exit,
}

struct Ingestor {
    fabric: Arc<dyn QueueFabric>,
    storage: Arc<dyn StorageDbManager>,
    events: WorkerEvents,
    queue: String,
    tag: String,
    consumer: Option<Box<dyn QueueConsumer>>,
    batch_size: usize,
    unreported: u64,
    last_report: Instant,
}

#[cfg_attr(feature = "tracing-instrumentation", tracing::instrument(skip_all))]
pub(crate) async fn run(context: WorkerContext, resources: WorkerResources) -> anyhow::Result<()> {
    let WorkerContext {
        descriptor,
        mut commands,
        events,
    } = context;
    let Some(queue) = descriptor.queue.clone() else {
        anyhow::bail!("ingestor #{} has no queue assigned", descriptor.worker_id);
    };
    let tag = super::consumer_tag(&descriptor);
    let consumer = resources.fabric.consumer(&queue, &tag).await?;
    tracing::info!(
        target: crate::INDEXER,
        "Ingestor #{} indexing {}",
        descriptor.worker_id,
        queue
    );

    let mut ingestor = Ingestor {
        fabric: Arc::clone(&resources.fabric),
        storage: Arc::clone(&resources.storage),
        events,
        queue,
        tag,
        consumer: Some(consumer),
        batch_size: resources.config.prefetch.index.max(1),
        unreported: 0,
        last_report: Instant::now(),
    };

    loop {
        if ingestor.consumer.is_some() {
            match commands.try_recv() {
                Ok(command) => {
                    if let Control::Exit = ingestor.handle_command(command).await? {
                        break;
                    }
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }
            ingestor.index_next_batch().await?;
        } else {
            // paused: nothing to index until the master says so
            match tokio::time::timeout(REPORT_INTERVAL, commands.recv()).await {
                Ok(Some(command)) => {
                    if let Control::Exit = ingestor.handle_command(command).await? {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        ingestor.report();
    }

    ingestor.unsubscribe().await?;
    ingestor.report();
    Ok(())
}

impl Ingestor {
    async fn handle_command(&mut self, command: MasterCommand) -> anyhow::Result<Control> {
        match command {
            MasterCommand::PauseIndexer { m_id } => {
                self.unsubscribe().await?;
                tracing::info!(target: crate::INDEXER, "Ingestor on {} paused [{}]", self.queue, m_id);
                self.events.emit(WorkerEvent::IndexerPaused { m_id });
            }
            MasterCommand::ResumeIndexer { m_id } => {
                if self.consumer.is_none() {
                    self.consumer = Some(self.fabric.consumer(&self.queue, &self.tag).await?);
                }
                tracing::info!(target: crate::INDEXER, "Ingestor on {} resumed [{}]", self.queue, m_id);
                self.events.emit(WorkerEvent::IndexerResumed { m_id });
            }
            MasterCommand::StopIndexer { m_id } => {
                self.unsubscribe().await?;
                self.events.emit(WorkerEvent::IndexerStopped { m_id });
                return Ok(Control::Exit);
            }
            MasterCommand::Stop => return Ok(Control::Exit),
            other => {
                tracing::debug!(target: crate::INDEXER, "Ingestor ignores {:?}", other);
            }
        }
        Ok(Control::Continue)
    }

    async fn unsubscribe(&mut self) -> anyhow::Result<()> {
        match self.consumer.take() {
            Some(consumer) => consumer.cancel().await,
            None => Ok(()),
        }
    }

    fn report(&mut self) {
        if self.unreported > 0 && self.last_report.elapsed() >= REPORT_INTERVAL {
            self.events.emit(WorkerEvent::AddIndex {
                size: self.unreported,
            });
            self.unreported = 0;
            self.last_report = Instant::now();
        }
    }

    /// Collects up to `batch_size` messages within the batch window.
    async fn collect_batch(&mut self) -> anyhow::Result<Vec<Delivery>> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Ok(vec![]);
        };
        let deadline = Instant::now() + BATCH_WINDOW;
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mut deliveries = consumer.fetch(self.batch_size - batch.len(), remaining).await?;
            if deliveries.is_empty() {
                break;
            }
            batch.append(&mut deliveries);
        }
        Ok(batch)
    }

    async fn index_next_batch(&mut self) -> anyhow::Result<()> {
        let batch = self.collect_batch().await?;
        let Some(consumer) = self.consumer.as_mut() else {
            return Ok(());
        };
        if batch.is_empty() {
            return Ok(());
        }

        let mut records = Vec::with_capacity(batch.len());
        let mut deliveries = Vec::with_capacity(batch.len());
        let mut undecodable = vec![];
        for delivery in batch {
            match IndexRecord::from_bytes(&delivery.payload) {
                Ok(record) => {
                    records.push(record);
                    deliveries.push(delivery);
                }
                Err(err) => {
                    tracing::error!(
                        target: crate::INDEXER,
                        "Dropping undecodable message from {}: {}",
                        self.queue,
                        err
                    );
                    undecodable.push(delivery);
                }
            }
        }
        if !undecodable.is_empty() {
            consumer.reject(&undecodable, false).await?;
        }
        if records.is_empty() {
            return Ok(());
        }

        let statuses = match self.storage.bulk_write(&records).await {
            Ok(statuses) if statuses.len() == records.len() => statuses,
            Ok(statuses) => {
                tracing::warn!(
                    target: crate::INDEXER,
                    "Bulk write on {} answered {} statuses for {} records",
                    self.queue,
                    statuses.len(),
                    records.len()
                );
                consumer.reject(&deliveries, true).await?;
                tokio::time::sleep(BULK_RETRY_DELAY).await;
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(target: crate::INDEXER, "Bulk write on {} failed: {:#}", self.queue, err);
                consumer.reject(&deliveries, true).await?;
                tokio::time::sleep(BULK_RETRY_DELAY).await;
                return Ok(());
            }
        };

        let mut settled = vec![];
        let mut failed = vec![];
        for ((delivery, record), status) in deliveries.into_iter().zip(&records).zip(statuses) {
            if status.is_settled() {
                settled.push(delivery);
            } else {
                tracing::warn!(
                    target: crate::INDEXER,
                    "{} {} not indexed: {:?}",
                    record.kind(),
                    record.document_id(),
                    status
                );
                failed.push(delivery);
            }
        }
        consumer.ack(&settled).await?;
        if !failed.is_empty() {
            consumer.reject(&failed, true).await?;
        }

        let indexed = settled.len() as u64;
        metrics::RECORDS_INDEXED_TOTAL.inc_by(indexed);
        self.unreported += indexed;
        Ok(())
    }
}
