//! Deserializer workers: consume raw block results from one stage-1 queue
//! and publish the decoded records to the indexing queues.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use logic_deserializer::{AbiCache, AbiSourceChain, BlockDeserializer, ChainApiAbiSource, DeserializedBlock, DeserializerSettings, StorageAbiSource};
use queue_fabric::{Delivery, QueueConsumer, QueueFabric};
use ship_client::{ChainApiClient, ShipProtocol};
use ship_primitives::{IndexRecord, MasterCommand, QueueNames, RecordKind, WorkerEvent};
use tokio::sync::mpsc::error::TryRecvError;

use super::{index_queue_count, FatalWorkerError, WorkerContext, WorkerEvents, WorkerResources};
use crate::metrics;

const FETCH_WAIT: Duration = Duration::from_millis(500);

/// Spreads records of each kind round-robin over that kind's queues.
pub(crate) struct RecordPublisher {
    fabric: Arc<dyn QueueFabric>,
    names: QueueNames,
    scaling: configuration::ScalingConfig,
    cursors: HashMap<RecordKind, usize>,
}

impl RecordPublisher {
    pub fn new(
        fabric: Arc<dyn QueueFabric>,
        names: QueueNames,
        scaling: configuration::ScalingConfig,
    ) -> Self {
        Self {
            fabric,
            names,
            scaling,
            cursors: HashMap::new(),
        }
    }

    fn next_queue(&mut self, kind: RecordKind) -> String {
        let queues = index_queue_count(&self.scaling, kind);
        let cursor = self.cursors.entry(kind).or_default();
        *cursor = *cursor % queues + 1;
        self.names.index(kind, *cursor)
    }

    pub async fn publish(&mut self, records: &[IndexRecord]) -> anyhow::Result<()> {
        let mut batches: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for record in records {
            let queue = self.next_queue(record.kind());
            batches.entry(queue).or_default().push(record.to_bytes()?);
        }
        for (queue, payloads) in batches {
            self.fabric.publish_batch(&queue, payloads).await?;
        }
        Ok(())
    }
}

struct DeserializerWorker {
    deserializer: BlockDeserializer,
    publisher: Option<RecordPublisher>,
    events: WorkerEvents,
    live: bool,
}

#[cfg_attr(feature = "tracing-instrumentation", tracing::instrument(skip_all))]
pub(crate) async fn run(
    context: WorkerContext,
    resources: WorkerResources,
    protocol: Arc<ShipProtocol>,
) -> anyhow::Result<()> {
    let WorkerContext {
        descriptor,
        mut commands,
        events,
    } = context;
    let Some(queue) = descriptor.queue.clone() else {
        anyhow::bail!("deserializer #{} has no queue assigned", descriptor.worker_id);
    };
    let config = &resources.config;

    let abi_cache = AbiCache::new(
        AbiSourceChain::new()
            .with_source(StorageAbiSource::new(Arc::clone(&resources.storage)))
            .with_source(ChainApiAbiSource::new(ChainApiClient::new(
                config.general.chain_api.clone(),
            ))),
    );
    let publisher = (!config.indexer.disable_indexing).then(|| {
        RecordPublisher::new(
            Arc::clone(&resources.fabric),
            resources.names.clone(),
            config.scaling.clone(),
        )
    });
    let mut worker = DeserializerWorker {
        deserializer: BlockDeserializer::new(
            protocol,
            DeserializerSettings::from(config.as_ref()),
            abi_cache,
        ),
        publisher,
        events,
        live: descriptor.live_mode,
    };

    let tag = super::consumer_tag(&descriptor);
    let mut consumer = resources.fabric.consumer(&queue, &tag).await?;
    let prefetch = config.prefetch.block.max(1);
    tracing::info!(target: crate::INDEXER, "Deserializer #{} consuming {}", descriptor.worker_id, queue);

    loop {
        match commands.try_recv() {
            Ok(MasterCommand::Stop) | Err(TryRecvError::Disconnected) => break,
            Ok(MasterCommand::UpdateAbi { data }) => {
                if worker.deserializer.apply_abi_update(&data).await? {
                    tracing::debug!(
                        target: crate::INDEXER,
                        "ABI of {} at block {} installed",
                        data.account,
                        data.block_num
                    );
                }
                continue;
            }
            Ok(other) => {
                tracing::debug!(target: crate::INDEXER, "Deserializer ignores {:?}", other);
                continue;
            }
            Err(TryRecvError::Empty) => {}
        }

        let deliveries = consumer.fetch(prefetch, FETCH_WAIT).await?;
        for delivery in deliveries {
            worker.process(consumer.as_mut(), delivery).await?;
        }
    }

    consumer.cancel().await
}

impl DeserializerWorker {
    /// Decodes one frame; the stage-1 message is acked only after all of its
    /// records reached the indexing queues.
    async fn process(&mut self, consumer: &mut dyn QueueConsumer, delivery: Delivery) -> anyhow::Result<()> {
        let block = self
            .deserializer
            .deserialize(&delivery.payload)
            .await
            .map_err(|err| FatalWorkerError(format!("block deserialization failed: {:#}", err)))?;
        let Some(block) = block else {
            tracing::debug!(target: crate::INDEXER, "Skipping a frame without block");
            consumer.ack(std::slice::from_ref(&delivery)).await?;
            return Ok(());
        };

        if let Some(publisher) = self.publisher.as_mut() {
            publisher.publish(&block.records).await?;
        }
        consumer.ack(std::slice::from_ref(&delivery)).await?;
        self.report(block);
        Ok(())
    }

    fn report(&self, block: DeserializedBlock) {
        for update in block.abi_updates {
            self.events.emit(WorkerEvent::SaveAbi { data: update });
        }
        for ds_error in block.ds_errors {
            metrics::DS_ERRORS_TOTAL.inc();
            self.events.emit(WorkerEvent::DsError { data: ds_error });
        }

        metrics::BLOCKS_CONSUMED_TOTAL.inc();
        metrics::ACTIONS_DESERIALIZED_TOTAL.inc_by(block.actions);
        metrics::DELTAS_DESERIALIZED_TOTAL.inc_by(block.deltas);
        // Prometheus Gauge Metric type do not support u64
        // https://github.com/tikv/rust-prometheus/issues/470
        metrics::LAST_PROCESSED_BLOCK.set(i64::from(block.block_num));

        self.events.emit(WorkerEvent::ConsumedBlock {
            block_num: block.block_num,
            block_id: block.block_id,
            producer: block.producer,
            lib: block.last_irreversible,
            live: self.live,
        });
        self.events.emit(WorkerEvent::DsReport {
            actions: block.actions,
            deltas: block.deltas,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::test_utils::test_config;
    use queue_fabric::{BrokerManagement, MemoryQueueFabric};

    fn block(block_num: u32) -> IndexRecord {
        IndexRecord::Block(ship_primitives::Block {
            timestamp: "2020-01-01T00:00:00.000".to_string(),
            block_num,
            block_id: format!("{:08x}", block_num),
            prev_id: String::new(),
            producer: "eosio".to_string(),
            schedule_version: 1,
            new_producers: None,
            cpu_usage: 0,
            net_usage: 0,
            trx_count: 0,
        })
    }

    #[tokio::test]
    async fn records_rotate_over_the_kind_queues() {
        let mut config = test_config("");
        config.scaling.indexing_queues = 3;
        let fabric = MemoryQueueFabric::default();
        let mut publisher = RecordPublisher::new(
            Arc::new(fabric.clone()),
            QueueNames::new("wax"),
            config.scaling.clone(),
        );
        let records: Vec<IndexRecord> = (1..=7).map(block).collect();
        publisher.publish(&records).await.unwrap();

        let depths: Vec<u64> = futures::future::join_all((1..=3).map(|i| {
            let fabric = fabric.clone();
            async move {
                let queue = format!("wax:index_blocks:{}", i);
                fabric.queue_info(&queue).await.unwrap().messages
            }
        }))
        .await;
        assert_eq!(depths, vec![3, 2, 2]);
    }
}
