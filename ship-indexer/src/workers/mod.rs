//! Worker tasks supervised by the master. Every worker owns a command
//! receiver and reports through a shared event channel; its exit, clean,
//! failed or panicked, is always delivered on the exits channel.
use std::sync::Arc;

use ship_client::{ShipProtocol, ValidatedShipServer};
use ship_primitives::{
    MasterCommand, QueueNames, RecordKind, WorkerDescriptor, WorkerEnvelope, WorkerEvent, WorkerRole,
};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub(crate) mod deserializer;
pub(crate) mod indexer;
pub(crate) mod reader;

/// Shared handles every worker is built from.
#[derive(Clone)]
pub(crate) struct WorkerResources {
    pub config: Arc<configuration::Config>,
    pub fabric: Arc<dyn queue_fabric::QueueFabric>,
    pub storage: Arc<dyn database::StorageDbManager>,
    pub names: QueueNames,
    pub servers: Arc<Vec<ValidatedShipServer>>,
}

#[derive(Clone)]
pub(crate) struct WorkerEvents {
    worker_id: usize,
    sender: mpsc::UnboundedSender<WorkerEnvelope>,
}

impl WorkerEvents {
    pub fn new(worker_id: usize, sender: mpsc::UnboundedSender<WorkerEnvelope>) -> Self {
        Self { worker_id, sender }
    }

    pub fn emit(&self, event: WorkerEvent) {
        if self
            .sender
            .send(WorkerEnvelope {
                worker_id: self.worker_id,
                event,
            })
            .is_err()
        {
            tracing::debug!(
                target: crate::INDEXER,
                "Worker {} event dropped, master is gone",
                self.worker_id
            );
        }
    }
}

pub(crate) struct WorkerContext {
    pub descriptor: WorkerDescriptor,
    pub commands: mpsc::UnboundedReceiver<MasterCommand>,
    pub events: WorkerEvents,
}

#[derive(Debug)]
pub(crate) struct WorkerExit {
    pub worker_id: usize,
    pub result: anyhow::Result<()>,
}

/// Master side of a running worker.
pub(crate) struct WorkerHandle {
    pub descriptor: WorkerDescriptor,
    commands: mpsc::UnboundedSender<MasterCommand>,
    abort: AbortHandle,
}

impl WorkerHandle {
    /// Returns false once the worker stopped listening.
    pub fn send(&self, command: MasterCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn kill(&self) {
        self.abort.abort();
    }

    /// Handle backed by a plain channel instead of a running worker.
    #[cfg(test)]
    pub(crate) fn detached(descriptor: WorkerDescriptor) -> (Self, mpsc::UnboundedReceiver<MasterCommand>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let abort = tokio::spawn(futures::future::pending::<()>()).abort_handle();
        (
            Self {
                descriptor,
                commands,
                abort,
            },
            receiver,
        )
    }
}

/// A failure the pipeline cannot recover from by relaunching the worker.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub(crate) struct FatalWorkerError(pub String);

pub(crate) fn spawn_worker(
    descriptor: WorkerDescriptor,
    resources: &WorkerResources,
    protocol: Option<&Arc<ShipProtocol>>,
    events: &mpsc::UnboundedSender<WorkerEnvelope>,
    exits: &mpsc::UnboundedSender<WorkerExit>,
) -> anyhow::Result<WorkerHandle> {
    let worker_id = descriptor.worker_id;
    let (commands_sender, commands) = mpsc::unbounded_channel();
    let context = WorkerContext {
        descriptor: descriptor.clone(),
        commands,
        events: WorkerEvents::new(worker_id, events.clone()),
    };
    let resources = resources.clone();
    let task = match descriptor.role {
        WorkerRole::Reader | WorkerRole::ContinuousReader => {
            tokio::spawn(reader::run(context, resources))
        }
        WorkerRole::Deserializer => {
            let Some(protocol) = protocol else {
                anyhow::bail!("deserializer #{} needs the history protocol ABI", worker_id);
            };
            tokio::spawn(deserializer::run(context, resources, Arc::clone(protocol)))
        }
        WorkerRole::Ingestor => tokio::spawn(indexer::run(context, resources)),
    };
    let abort = task.abort_handle();

    let exits = exits.clone();
    tokio::spawn(async move {
        let result = match task.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(anyhow::anyhow!("worker panicked: {}", err)),
        };
        let _ = exits.send(WorkerExit { worker_id, result });
    });

    tracing::debug!(
        target: crate::INDEXER,
        "Launched {} #{} on {:?}",
        descriptor.role,
        worker_id,
        descriptor.queue
    );
    Ok(WorkerHandle {
        descriptor,
        commands: commands_sender,
        abort,
    })
}

/// Queue subscription name of a worker. Stable across relaunches, so a
/// relaunched consumer reclaims what its previous incarnation held.
pub(crate) fn consumer_tag(descriptor: &WorkerDescriptor) -> String {
    format!("{}-{}", descriptor.role, descriptor.local_id)
}

/// Number of indexing queues created for `kind`.
pub(crate) fn index_queue_count(scaling: &configuration::ScalingConfig, kind: RecordKind) -> usize {
    let count = match kind {
        RecordKind::Action | RecordKind::Delta => scaling.ad_idx_queues,
        RecordKind::TableState => scaling.dyn_idx_queues,
        RecordKind::Abi | RecordKind::TrxError => 1,
        RecordKind::Block => scaling.indexing_queues,
    };
    count.max(1)
}

/// Record kinds the deserializers can produce with the current features.
pub(crate) fn enabled_record_kinds(config: &configuration::Config) -> Vec<RecordKind> {
    RecordKind::ALL
        .into_iter()
        .filter(|kind| match kind {
            RecordKind::Block | RecordKind::Action | RecordKind::Abi => true,
            RecordKind::Delta => config.features.index_deltas,
            RecordKind::TableState => {
                config.features.accounts_table || config.features.voters_table
            }
            RecordKind::TrxError => config.features.failed_trx,
        })
        .collect()
}
