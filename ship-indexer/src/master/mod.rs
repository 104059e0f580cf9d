//! The master controller: validates the environment, spawns and supervises
//! every worker, hands out block ranges, applies queue backpressure and
//! watches overall progress.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use database::{ReaderDbManager, StorageDbManager};
use queue_fabric::{BrokerManagement, QueueFabric};
use ship_client::{ChainApiClient, ChainInfo, ShipEndpoint, ShipProtocol, StateHistorySocket, ValidatedShipServer};
use ship_primitives::{BlockRange, MasterCommand, QueueNames, WorkerDescriptor, WorkerEnvelope, WorkerEvent, WorkerRole};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_retry::{strategy::FixedInterval, Retry};

use crate::metrics;
use crate::workers::{self, FatalWorkerError, WorkerExit, WorkerHandle, WorkerResources};

mod alerts;
mod control;
mod monitor;
mod queues;
mod ranges;

pub use control::{ControlError, ControlHandle};
pub(crate) use control::{ControlRequest, CONTROL_TIMEOUT};

use alerts::{Alert, AlertKind};
use control::{ControlOperation, PendingControls};
use monitor::{MonitorAction, MonitorContext, Stats, INDEX_MONITOR_INTERVAL};
use queues::{Backpressure, QueueMonitor};
use ranges::{find_range, IndexingRange, RangeAllocator};

const RELAUNCH_DELAY: Duration = Duration::from_secs(5);
const FIRST_QUEUE_CHECK: Duration = Duration::from_secs(3);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const CHAIN_API_ATTEMPTS: usize = 10;
const CHAIN_API_RETRY_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MasterState {
    CatchingUp,
    RangeCompleted,
    LiveOnly,
}

enum Flow {
    Continue,
    Shutdown,
}

pub(crate) struct Master {
    resources: WorkerResources,
    management: Arc<dyn BrokerManagement>,
    alerts: Arc<dyn Alert>,
    protocol: Option<Arc<ShipProtocol>>,
    workers: BTreeMap<usize, WorkerHandle>,
    /// Crashed workers waiting for their relaunch, with the queue they consume.
    pending_relaunches: BTreeMap<usize, Option<String>>,
    next_worker_id: usize,
    local_ids: HashMap<WorkerRole, usize>,
    events_sender: mpsc::UnboundedSender<WorkerEnvelope>,
    events: mpsc::UnboundedReceiver<WorkerEnvelope>,
    exits_sender: mpsc::UnboundedSender<WorkerExit>,
    exits: mpsc::UnboundedReceiver<WorkerExit>,
    relaunch_sender: mpsc::UnboundedSender<WorkerDescriptor>,
    relaunches: mpsc::UnboundedReceiver<WorkerDescriptor>,
    control_requests: mpsc::UnboundedReceiver<ControlRequest>,
    pending_controls: PendingControls,
    allocator: RangeAllocator,
    queue_monitor: QueueMonitor,
    stats: Stats,
    state: MasterState,
    mode_transition: bool,
    shutting_down: bool,
    started_at: Instant,
}

impl Master {
    pub(crate) fn new(
        config: configuration::Config,
        fabric: Arc<dyn QueueFabric>,
        management: Arc<dyn BrokerManagement>,
        storage: Arc<dyn StorageDbManager>,
        control_requests: mpsc::UnboundedReceiver<ControlRequest>,
    ) -> anyhow::Result<Self> {
        let limits = config.scaling.queue_limits()?;
        let queue_monitor = QueueMonitor::new(
            limits,
            config.scaling.auto_scale_trigger,
            config.scaling.max_autoscale,
        );
        let allocator = RangeAllocator::new(
            IndexingRange {
                starting_block: 0,
                head: 0,
            },
            config.scaling.batch_size,
        );
        let (events_sender, events) = mpsc::unbounded_channel();
        let (exits_sender, exits) = mpsc::unbounded_channel();
        let (relaunch_sender, relaunches) = mpsc::unbounded_channel();
        Ok(Self {
            resources: WorkerResources {
                names: QueueNames::new(config.general.chain.clone()),
                config: Arc::new(config),
                fabric,
                storage,
                servers: Arc::new(vec![]),
            },
            management,
            alerts: alerts::default_alerts(),
            protocol: None,
            workers: BTreeMap::new(),
            pending_relaunches: BTreeMap::new(),
            next_worker_id: 1,
            local_ids: HashMap::new(),
            events_sender,
            events,
            exits_sender,
            exits,
            relaunch_sender,
            relaunches,
            control_requests,
            pending_controls: PendingControls::default(),
            allocator,
            queue_monitor,
            stats: Stats::new(0),
            state: MasterState::CatchingUp,
            mode_transition: false,
            shutting_down: false,
            started_at: Instant::now(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_alerts(mut self, alerts: Arc<dyn Alert>) -> Self {
        self.alerts = alerts;
        self
    }

    fn config(&self) -> &configuration::Config {
        &self.resources.config
    }

    pub(crate) async fn run(mut self) -> anyhow::Result<()> {
        self.start().await?;
        let result = self.main_loop().await;
        self.shutdown().await?;
        result
    }

    #[cfg_attr(feature = "tracing-instrumentation", tracing::instrument(skip_all))]
    async fn start(&mut self) -> anyhow::Result<()> {
        let chain_info = self.wait_for_chain_api().await?;
        let chain_id = match &self.config().general.chain_id {
            Some(expected) if !expected.eq_ignore_ascii_case(&chain_info.chain_id) => {
                anyhow::bail!(
                    "Chain API serves chain {} but {} is configured",
                    chain_info.chain_id,
                    expected
                );
            }
            Some(expected) => expected.clone(),
            None => chain_info.chain_id.clone(),
        };
        self.adopt_chain_id(&chain_id);
        tracing::info!(
            target: crate::INDEXER,
            "Chain API online: {} at block #{}",
            chain_info.server_version_string.as_deref().unwrap_or(&chain_info.server_version),
            chain_info.head_block_num
        );

        let endpoints = self
            .config()
            .ship
            .iter()
            .map(|ship| ShipEndpoint::new(ship.label.clone(), ship.url.clone()))
            .collect();
        let socket = StateHistorySocket::new(endpoints, Some(self.config().general.max_ws_payload_mb))?;
        let servers = socket.validate_ship_servers(&chain_id).await;
        if servers.is_empty() {
            anyhow::bail!("No valid history endpoint serves chain {}", chain_id);
        }
        tracing::info!(target: crate::INDEXER, "{} history endpoint(s) validated", servers.len());

        let mut probe = StateHistorySocket::from_validated(&servers, Some(self.config().general.max_ws_payload_mb))?;
        let connection = probe.connect().await?;
        self.protocol = Some(connection.protocol());
        probe.close(connection, true).await;
        self.resources.servers = Arc::new(servers);

        if self.config().indexer.purge_queues {
            self.purge_queues(true).await;
        }
        self.recover_queues().await;

        let range = self.find_range(chain_info.head_block_num).await?;
        self.prepare_range(range);
        self.launch_workers(range)
    }

    async fn wait_for_chain_api(&self) -> anyhow::Result<ChainInfo> {
        let client = ChainApiClient::new(self.config().general.chain_api.clone());
        let strategy = FixedInterval::from_millis(CHAIN_API_RETRY_MS).take(CHAIN_API_ATTEMPTS - 1);
        Retry::start(strategy, || async {
            client.get_info().await.map_err(|err| {
                tracing::warn!(target: crate::INDEXER, "Chain API not available: {}", err);
                err
            })
        })
        .await
        .map_err(|err| {
            anyhow::anyhow!(
                "Chain API {} unreachable after {} attempts: {}",
                self.config().general.chain_api,
                CHAIN_API_ATTEMPTS,
                err
            )
        })
    }

    /// Workers resolve chain specific behavior from the configured chain id,
    /// which falls back to the one the chain API reports.
    fn adopt_chain_id(&mut self, chain_id: &str) {
        if self.config().general.chain_id.as_deref() == Some(chain_id) {
            return;
        }
        let mut config = self.config().clone();
        config.general.chain_id = Some(chain_id.to_string());
        self.resources.config = Arc::new(config);
    }

    async fn find_range(&self, chain_head: u32) -> anyhow::Result<IndexingRange> {
        let last_indexed = self.resources.storage.get_last_indexed_block().await?;
        let trace_begin = self
            .resources
            .servers
            .iter()
            .map(|server| server.trace_begin_block)
            .filter(|block| *block > 0)
            .min();
        let range = find_range(&self.config().indexer, last_indexed, trace_begin, chain_head);
        tracing::info!(
            target: crate::INDEXER,
            "Indexing range: {} to {} (last indexed block {:?})",
            range.starting_block,
            range.head,
            last_indexed
        );
        Ok(range)
    }

    fn prepare_range(&mut self, range: IndexingRange) {
        let live_only = self.config().indexer.live_only_mode;
        let range_blocks = if live_only || self.config().indexer.disable_reading {
            0
        } else {
            u64::from(range.head.saturating_sub(range.starting_block))
        };
        self.allocator = RangeAllocator::new(range, self.config().scaling.batch_size);
        self.stats = Stats::new(range_blocks);
        self.state = if live_only {
            MasterState::LiveOnly
        } else {
            MasterState::CatchingUp
        };
    }

    /// Every queue the pipeline uses with the current settings.
    fn queue_names(&self, include_index_queues: bool) -> Vec<String> {
        let config = self.config();
        let names = &self.resources.names;
        let mut queues: Vec<String> = (1..=config.scaling.ds_queues.max(1))
            .map(|index| names.blocks(index))
            .collect();
        queues.push(names.live_blocks());
        if include_index_queues {
            for kind in workers::enabled_record_kinds(config) {
                for index in 1..=workers::index_queue_count(&config.scaling, kind) {
                    queues.push(names.index(kind, index));
                }
            }
        }
        queues
    }

    async fn purge_queues(&self, include_index_queues: bool) {
        for queue in self.queue_names(include_index_queues) {
            match self.management.purge(&queue).await {
                Ok(()) => tracing::debug!(target: crate::INDEXER, "Purged {}", queue),
                Err(err) => tracing::warn!(target: crate::INDEXER, "Failed to purge {}: {}", queue, err),
            }
        }
    }

    /// Hands messages left unacked by consumers of a previous run back to
    /// their queues. Runs before any consumer starts.
    async fn recover_queues(&self) {
        for queue in self.queue_names(true) {
            match self.resources.fabric.recover(&queue).await {
                Ok(0) => {}
                Ok(recovered) => tracing::info!(target: crate::INDEXER, "{} unacked messages back on {}", recovered, queue),
                Err(err) => tracing::warn!(target: crate::INDEXER, "Failed to recover {}: {}", queue, err),
            }
        }
    }

    /// Returns whatever a stopped worker's consumer still held to its queue.
    async fn release_consumer(&self, descriptor: &WorkerDescriptor) {
        let Some(queue) = &descriptor.queue else {
            return;
        };
        let tag = workers::consumer_tag(descriptor);
        match self.resources.fabric.release(queue, &tag).await {
            Ok(0) => {}
            Ok(released) => tracing::info!(
                target: crate::INDEXER,
                "{} unacked messages of {} back on {}",
                released,
                tag,
                queue
            ),
            Err(err) => tracing::warn!(target: crate::INDEXER, "Failed to release {} on {}: {}", tag, queue, err),
        }
    }

    fn next_descriptor(&mut self, role: WorkerRole) -> WorkerDescriptor {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let local_id = self.local_ids.entry(role).or_default();
        *local_id += 1;
        WorkerDescriptor::new(worker_id, role, *local_id)
    }

    fn spawn(&mut self, descriptor: WorkerDescriptor) -> anyhow::Result<()> {
        let handle = workers::spawn_worker(
            descriptor,
            &self.resources,
            self.protocol.as_ref(),
            &self.events_sender,
            &self.exits_sender,
        )?;
        self.register(handle);
        Ok(())
    }

    fn register(&mut self, handle: WorkerHandle) {
        let reader = matches!(
            handle.descriptor.role,
            WorkerRole::Reader | WorkerRole::ContinuousReader
        );
        if reader && self.queue_monitor.readers_paused() {
            handle.send(MasterCommand::Pause);
        }
        self.workers.insert(handle.descriptor.worker_id, handle);
        metrics::ACTIVE_WORKERS.set(self.workers.len() as i64);
    }

    fn launch_workers(&mut self, range: IndexingRange) -> anyhow::Result<()> {
        let config = Arc::clone(&self.resources.config);
        let live_only = config.indexer.live_only_mode;
        let live_reader = (config.indexer.live_reader || live_only) && config.indexer.stop_on == 0;

        if config.indexer.disable_reading {
            tracing::warn!(target: crate::INDEXER, "Block reading is disabled");
        } else {
            if !live_only {
                for _ in 0..config.scaling.readers.max(1) {
                    let Some(block_range) = self.allocator.next_range() else {
                        break;
                    };
                    let descriptor = self.next_descriptor(WorkerRole::Reader).with_range(block_range);
                    self.spawn(descriptor)?;
                }
            }
            if live_reader {
                let descriptor = self
                    .next_descriptor(WorkerRole::ContinuousReader)
                    .with_range(BlockRange::new(range.head, u32::MAX))
                    .live();
                self.spawn(descriptor)?;
            }
        }

        if !live_only {
            for queue_index in 1..=config.scaling.ds_queues.max(1) {
                for _ in 0..config.scaling.ds_threads.max(1) {
                    let queue = self.resources.names.blocks(queue_index);
                    let descriptor = self.next_descriptor(WorkerRole::Deserializer).with_queue(queue);
                    self.spawn(descriptor)?;
                }
            }
        }
        if live_reader {
            for _ in 0..config.scaling.ds_threads.max(1) {
                let queue = self.resources.names.live_blocks();
                let descriptor = self
                    .next_descriptor(WorkerRole::Deserializer)
                    .with_queue(queue)
                    .live();
                self.spawn(descriptor)?;
            }
        }

        if config.indexer.disable_indexing {
            tracing::warn!(target: crate::INDEXER, "Indexing is disabled");
        } else {
            for kind in workers::enabled_record_kinds(&config) {
                for index in 1..=workers::index_queue_count(&config.scaling, kind) {
                    let queue = self.resources.names.index(kind, index);
                    let descriptor = self.next_descriptor(WorkerRole::Ingestor).with_queue(queue);
                    self.spawn(descriptor)?;
                }
            }
        }

        tracing::info!(
            target: crate::INDEXER,
            "{} workers launched ({:?})",
            self.workers.len(),
            self.state
        );
        Ok(())
    }

    async fn main_loop(&mut self) -> anyhow::Result<()> {
        let polling_interval = Duration::from_millis(self.config().scaling.polling_interval.max(1));
        let mut queue_check = tokio::time::interval_at(Instant::now() + FIRST_QUEUE_CHECK, polling_interval);
        queue_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut index_check =
            tokio::time::interval_at(Instant::now() + INDEX_MONITOR_INTERVAL, INDEX_MONITOR_INTERVAL);
        index_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let interrupted = tokio::signal::ctrl_c();
        tokio::pin!(interrupted);

        loop {
            tokio::select! {
                Some(envelope) = self.events.recv() => self.handle_event(envelope),
                Some(exit) = self.exits.recv() => self.handle_exit(exit).await?,
                Some(descriptor) = self.relaunches.recv() => self.relaunch(descriptor)?,
                Some(request) = self.control_requests.recv() => self.handle_control(request),
                _ = queue_check.tick() => self.check_queues().await?,
                _ = index_check.tick() => {
                    if let Flow::Shutdown = self.check_indexing().await? {
                        return Ok(());
                    }
                }
                _ = &mut interrupted => {
                    tracing::info!(target: crate::INDEXER, "Interrupted, shutting down");
                    return Ok(());
                }
            }
        }
    }

    fn handle_event(&mut self, envelope: WorkerEnvelope) {
        let worker_id = envelope.worker_id;
        match envelope.event {
            WorkerEvent::InitAbi { data } => {
                let unchanged = self
                    .protocol
                    .as_ref()
                    .is_some_and(|protocol| protocol.json() == data);
                if !unchanged {
                    match ShipProtocol::from_json(&data) {
                        Ok(protocol) => {
                            tracing::info!(target: crate::INDEXER, "History protocol ABI updated by #{}", worker_id);
                            self.protocol = Some(Arc::new(protocol));
                        }
                        Err(err) => tracing::warn!(target: crate::INDEXER, "Invalid protocol ABI from #{}: {}", worker_id, err),
                    }
                }
            }
            WorkerEvent::ReadBlock { live, .. } => self.stats.record_read(live),
            WorkerEvent::ConsumedBlock {
                block_num,
                lib,
                live,
                ..
            } => {
                self.stats.record_consumed(block_num, lib, live);
                metrics::LAST_IRREVERSIBLE_BLOCK.set(i64::from(self.stats.last_irreversible_block()));
            }
            WorkerEvent::Completed => self.assign_next_range(worker_id),
            WorkerEvent::UpdateLastAssignedBlock { block_num } => {
                self.allocator.advance_to(block_num);
            }
            WorkerEvent::DsReport { actions, deltas } => self.stats.record_ds_report(actions, deltas),
            WorkerEvent::DsError { data } => {
                tracing::warn!(
                    target: crate::INDEXER,
                    "Block #{} {} could not be decoded: {}",
                    data.block_num,
                    data.type_name,
                    data.message
                );
            }
            WorkerEvent::AddIndex { size } => self.stats.record_indexed(size),
            WorkerEvent::SaveAbi { data } => {
                self.stats.record_abi();
                for handle in self.workers.values() {
                    if handle.descriptor.role == WorkerRole::Deserializer && handle.descriptor.worker_id != worker_id {
                        handle.send(MasterCommand::UpdateAbi { data: data.clone() });
                    }
                }
            }
            WorkerEvent::ForkEvent { data } => {
                self.alerts.emit(
                    AlertKind::Fork,
                    &format!(
                        "Fork at blocks {} to {}, new block id {}",
                        data.starting_block, data.ending_block, data.new_id
                    ),
                );
            }
            WorkerEvent::Lib { block_num } => {
                self.stats.record_lib(block_num);
                metrics::LAST_IRREVERSIBLE_BLOCK.set(i64::from(self.stats.last_irreversible_block()));
            }
            WorkerEvent::IndexerPaused { m_id }
            | WorkerEvent::IndexerResumed { m_id }
            | WorkerEvent::IndexerStopped { m_id } => {
                self.pending_controls.acknowledge(&m_id, worker_id);
            }
        }
    }

    fn assign_next_range(&mut self, worker_id: usize) {
        let Some(handle) = self.workers.get_mut(&worker_id) else {
            return;
        };
        match self.allocator.next_range() {
            Some(range) => {
                handle.descriptor.range = Some(range);
                handle.send(MasterCommand::NewRange { data: range });
            }
            None => {
                tracing::info!(
                    target: crate::INDEXER,
                    "Reader #{} finished, every block up to {} is assigned",
                    worker_id,
                    self.allocator.head()
                );
                handle.send(MasterCommand::Stop);
                self.workers.remove(&worker_id);
                metrics::ACTIVE_WORKERS.set(self.workers.len() as i64);
            }
        }
    }

    async fn handle_exit(&mut self, exit: WorkerExit) -> anyhow::Result<()> {
        let Some(handle) = self.workers.remove(&exit.worker_id) else {
            return Ok(());
        };
        metrics::ACTIVE_WORKERS.set(self.workers.len() as i64);
        let descriptor = handle.descriptor;
        self.release_consumer(&descriptor).await;
        let err = match exit.result {
            Ok(()) => {
                tracing::info!(target: crate::INDEXER, "{} #{} exited", descriptor.role, descriptor.worker_id);
                return Ok(());
            }
            Err(err) => err,
        };
        self.pending_controls.forget_worker(descriptor.worker_id);
        if let Some(fatal) = err.downcast_ref::<FatalWorkerError>() {
            anyhow::bail!("{} #{} failed: {}", descriptor.role, descriptor.worker_id, fatal);
        }
        self.alerts.emit(
            AlertKind::WorkerCrash,
            &format!("{} #{} crashed: {:#}", descriptor.role, descriptor.worker_id, err),
        );
        if self.mode_transition || self.shutting_down {
            return Ok(());
        }

        self.pending_relaunches
            .insert(descriptor.worker_id, descriptor.queue.clone());
        let sender = self.relaunch_sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RELAUNCH_DELAY).await;
            let _ = sender.send(descriptor);
        });
        Ok(())
    }

    fn relaunch(&mut self, mut descriptor: WorkerDescriptor) -> anyhow::Result<()> {
        // dropped by a mode switch in the meantime
        if self.pending_relaunches.remove(&descriptor.worker_id).is_none() {
            return Ok(());
        }
        if self.mode_transition || self.shutting_down {
            return Ok(());
        }
        descriptor.failures += 1;
        descriptor.worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        tracing::warn!(
            target: crate::INDEXER,
            "Relaunching {} as #{} (failures: {})",
            descriptor.role,
            descriptor.worker_id,
            descriptor.failures
        );
        metrics::WORKER_RESTARTS_TOTAL.inc();
        self.spawn(descriptor)
    }

    fn handle_control(&mut self, request: ControlRequest) {
        self.pending_controls.prune();
        let (kind, command): (_, fn(String) -> MasterCommand) = match request.operation {
            ControlOperation::Pause(kind) => (kind, |m_id| MasterCommand::PauseIndexer { m_id }),
            ControlOperation::Resume(kind) => (kind, |m_id| MasterCommand::ResumeIndexer { m_id }),
            ControlOperation::Stop => (None, |m_id| MasterCommand::StopIndexer { m_id }),
        };
        let names = &self.resources.names;
        let targets: HashSet<usize> = self
            .workers
            .values()
            .filter(|handle| handle.descriptor.role == WorkerRole::Ingestor)
            .filter(|handle| match kind {
                Some(kind) => handle
                    .descriptor
                    .queue
                    .as_deref()
                    .and_then(|queue| names.kind_of(queue))
                    == Some(kind),
                None => true,
            })
            .filter(|handle| handle.send(command(request.m_id.clone())))
            .map(|handle| handle.descriptor.worker_id)
            .collect();
        tracing::info!(
            target: crate::INDEXER,
            "Control {:?} [{}] sent to {} ingestor(s)",
            request.operation,
            request.m_id,
            targets.len()
        );
        self.pending_controls.register(request.m_id, targets, request.reply);
    }

    fn readers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values().filter(|handle| {
            matches!(
                handle.descriptor.role,
                WorkerRole::Reader | WorkerRole::ContinuousReader
            )
        })
    }

    fn send_to_readers(&self, command: MasterCommand) {
        for reader in self.readers() {
            reader.send(command.clone());
        }
    }

    /// Consumers the master runs per queue, pending relaunches included.
    fn consumers_per_queue(&self) -> BTreeMap<String, u64> {
        let mut consumers = BTreeMap::new();
        let running = self.workers.values().map(|handle| &handle.descriptor.queue);
        for queue in running.chain(self.pending_relaunches.values()).flatten() {
            *consumers.entry(queue.clone()).or_default() += 1;
        }
        consumers
    }

    async fn check_queues(&mut self) -> anyhow::Result<()> {
        if self.mode_transition {
            return Ok(());
        }
        let mut descriptors = vec![];
        for (queue, consumers) in self.consumers_per_queue() {
            match self.management.queue_info(&queue).await {
                Ok(info) => {
                    metrics::QUEUE_DEPTH
                        .with_label_values(&[&queue])
                        .set(i64::try_from(info.messages).unwrap_or(i64::MAX));
                    descriptors.push(self.queue_monitor.describe(&self.resources.names, info, consumers));
                }
                Err(err) => tracing::warn!(target: crate::INDEXER, "Failed to check {}: {}", queue, err),
            }
        }

        let decision = self.queue_monitor.evaluate(&descriptors);
        match decision.backpressure {
            Backpressure::Pause => {
                let full: Vec<&str> = descriptors
                    .iter()
                    .filter(|queue| queue.is_above_limit())
                    .map(|queue| queue.name.as_str())
                    .collect();
                tracing::warn!(target: crate::INDEXER, "Pausing readers, queues over limit: {:?}", full);
                metrics::READERS_PAUSED.set(1);
                self.send_to_readers(MasterCommand::Pause);
            }
            Backpressure::Resume => {
                tracing::info!(target: crate::INDEXER, "Queues drained, resuming readers");
                metrics::READERS_PAUSED.set(0);
                self.send_to_readers(MasterCommand::Resume);
            }
            Backpressure::Unchanged => {}
        }

        for queue in decision.scale_up {
            let descriptor = self.next_descriptor(WorkerRole::Ingestor).with_queue(queue.clone());
            self.spawn(descriptor)?;
            tracing::info!(
                target: crate::INDEXER,
                "Autoscaling {} to {} consumers",
                queue,
                self.consumers_per_queue().get(&queue).copied().unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn check_indexing(&mut self) -> anyhow::Result<Flow> {
        let context = MonitorContext {
            workers: self.workers.len(),
            readers: self.readers().count(),
            validated_servers: self.resources.servers.len(),
            auto_stop: self.config().indexer.auto_stop,
            mode_transition: self.mode_transition,
        };
        for action in self.stats.tick(INDEX_MONITOR_INTERVAL, context) {
            match action {
                MonitorAction::RangeCompleted(summary) => {
                    let message = format!(
                        "Range completed in {} | blocks: {} | actions: {} | deltas: {} | abis: {}",
                        humantime::format_duration(Duration::from_secs(summary.elapsed.as_secs())),
                        summary.blocks,
                        summary.actions,
                        summary.deltas,
                        summary.abis
                    );
                    tracing::info!(target: crate::INDEXER, "{}", message);
                    self.alerts.emit(AlertKind::RangeCompleted, &message);
                    let has_live_reader = self
                        .readers()
                        .any(|reader| reader.descriptor.role == WorkerRole::ContinuousReader);
                    self.state = if has_live_reader {
                        MasterState::LiveOnly
                    } else {
                        MasterState::RangeCompleted
                    };
                    let indexer_config = &self.config().indexer;
                    if indexer_config.abi_scan_mode && indexer_config.auto_mode_switch {
                        self.switch_to_full_indexing().await?;
                        return Ok(Flow::Continue);
                    }
                }
                MonitorAction::Alert(kind, message) => self.alerts.emit(kind, &message),
                MonitorAction::NextServer => {
                    tracing::warn!(target: crate::INDEXER, "Readers idle, switching history endpoint");
                    self.send_to_readers(MasterCommand::NextServer);
                }
                MonitorAction::Exit(reason) => {
                    tracing::info!(target: crate::INDEXER, "Stopping: {}", reason);
                    return Ok(Flow::Shutdown);
                }
                MonitorAction::Fatal(reason) => anyhow::bail!("{}", reason),
            }
        }
        Ok(Flow::Continue)
    }

    /// Ends an ABI scan: the whole pipeline is relaunched with full indexing.
    async fn switch_to_full_indexing(&mut self) -> anyhow::Result<()> {
        self.mode_transition = true;
        self.alerts.emit(
            AlertKind::ModeSwitch,
            "ABI scan completed, switching to full indexing",
        );
        self.pending_relaunches.clear();
        let handles: Vec<WorkerHandle> = std::mem::take(&mut self.workers).into_values().collect();
        self.kill_workers(handles).await;
        metrics::ACTIVE_WORKERS.set(0);
        self.queue_monitor.reset();
        metrics::READERS_PAUSED.set(0);
        self.purge_queues(false).await;

        let mut config = self.config().clone();
        config.indexer.abi_scan_mode = false;
        config.indexer.rewrite = true;
        self.resources.config = Arc::new(config);

        let chain_info = self.wait_for_chain_api().await?;
        let range = self.find_range(chain_info.head_block_num).await?;
        self.prepare_range(range);
        self.launch_workers(range)?;
        self.mode_transition = false;
        Ok(())
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.shutting_down = true;
        let elapsed = self.started_at.elapsed();
        if elapsed < SHUTDOWN_GRACE {
            tracing::info!(target: crate::INDEXER, "Waiting for the startup grace period before stopping");
            tokio::time::sleep(SHUTDOWN_GRACE - elapsed).await;
        }

        self.pending_relaunches.clear();
        for handle in self.workers.values() {
            handle.send(MasterCommand::Stop);
        }
        let deadline = Instant::now() + WORKER_STOP_TIMEOUT;
        while !self.workers.is_empty() {
            match tokio::time::timeout_at(deadline, self.exits.recv()).await {
                Ok(Some(exit)) => {
                    if let Some(handle) = self.workers.remove(&exit.worker_id) {
                        if let Err(err) = exit.result {
                            tracing::warn!(target: crate::INDEXER, "{} #{} stopped with error: {:#}", handle.descriptor.role, exit.worker_id, err);
                        }
                        self.release_consumer(&handle.descriptor).await;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(target: crate::INDEXER, "{} workers did not stop in time", self.workers.len());
                    let handles: Vec<WorkerHandle> = std::mem::take(&mut self.workers).into_values().collect();
                    self.kill_workers(handles).await;
                }
            }
        }
        metrics::ACTIVE_WORKERS.set(0);

        let last_block = match self.resources.storage.get_last_indexed_block().await {
            Ok(Some(block_num)) => block_num,
            Ok(None) => self.stats.last_processed_block(),
            Err(err) => {
                tracing::warn!(target: crate::INDEXER, "Could not read the last indexed block: {}", err);
                self.stats.last_processed_block()
            }
        };
        if last_block > 0 {
            let path = self.last_block_path();
            crate::configs::write_last_block(&path, last_block)?;
            tracing::info!(target: crate::INDEXER, "Last indexed block {} saved to {:?}", last_block, path);
        }
        Ok(())
    }

    /// Aborts `handles`, waits for their tasks to end and releases what
    /// their consumers held.
    async fn kill_workers(&mut self, handles: Vec<WorkerHandle>) {
        let mut running: HashSet<usize> = handles.iter().map(|handle| handle.descriptor.worker_id).collect();
        for handle in &handles {
            handle.kill();
        }
        let deadline = Instant::now() + WORKER_STOP_TIMEOUT;
        while !running.is_empty() {
            match tokio::time::timeout_at(deadline, self.exits.recv()).await {
                Ok(Some(exit)) => {
                    running.remove(&exit.worker_id);
                }
                Ok(None) | Err(_) => break,
            }
        }
        if !running.is_empty() {
            tracing::warn!(target: crate::INDEXER, "{} killed workers did not report their exit", running.len());
        }
        for handle in &handles {
            self.release_consumer(&handle.descriptor).await;
        }
    }

    fn last_block_path(&self) -> PathBuf {
        crate::configs::last_block_file(&self.config().general.data_dir, &self.config().general.chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::test_utils::test_config;
    use queue_fabric::MemoryQueueFabric;
    use ship_primitives::{AbiUpdate, RecordKind};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordedAlerts(Mutex<Vec<AlertKind>>);

    impl Alert for RecordedAlerts {
        fn emit(&self, kind: AlertKind, _message: &str) {
            self.0.lock().unwrap().push(kind);
        }
    }

    /// Memory fabric that records which queues and consumers the master
    /// asked to hand messages back.
    #[derive(Default)]
    struct RecordingFabric {
        inner: MemoryQueueFabric,
        recovered: Mutex<Vec<String>>,
        released: Mutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl QueueFabric for RecordingFabric {
        async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()> {
            self.inner.publish(queue, payload).await
        }

        async fn consumer(&self, queue: &str, tag: &str) -> anyhow::Result<Box<dyn queue_fabric::QueueConsumer>> {
            self.inner.consumer(queue, tag).await
        }

        async fn recover(&self, queue: &str) -> anyhow::Result<u64> {
            self.recovered.lock().unwrap().push(queue.to_string());
            Ok(0)
        }

        async fn release(&self, queue: &str, tag: &str) -> anyhow::Result<u64> {
            self.released
                .lock()
                .unwrap()
                .push((queue.to_string(), tag.to_string()));
            Ok(0)
        }
    }

    fn master_with(
        config: configuration::Config,
        fabric: Arc<dyn QueueFabric>,
        management: Arc<dyn BrokerManagement>,
    ) -> (Master, ControlHandle) {
        let storage = Arc::new(database::MemoryDbManager::with_prefix("wax"));
        let (control, requests) = ControlHandle::new(Duration::from_secs(5));
        let master = Master::new(config, fabric, management, storage, requests).unwrap();
        (master, control)
    }

    fn master() -> (Master, MemoryQueueFabric, ControlHandle) {
        let fabric = MemoryQueueFabric::default();
        let (master, control) = master_with(
            test_config(""),
            Arc::new(fabric.clone()),
            Arc::new(fabric.clone()),
        );
        (master, fabric, control)
    }

    fn attach(
        master: &mut Master,
        role: WorkerRole,
        queue: Option<String>,
    ) -> (usize, mpsc::UnboundedReceiver<MasterCommand>) {
        let mut descriptor = master.next_descriptor(role);
        descriptor.queue = queue;
        let worker_id = descriptor.worker_id;
        let (handle, commands) = WorkerHandle::detached(descriptor);
        master.register(handle);
        (worker_id, commands)
    }

    #[tokio::test]
    async fn completed_readers_get_ranges_until_head() {
        let (mut master, _, _) = master();
        master.allocator = RangeAllocator::new(
            IndexingRange {
                starting_block: 1,
                head: 8000,
            },
            5000,
        );
        let (reader, mut commands) = attach(&mut master, WorkerRole::Reader, None);

        master.handle_event(WorkerEnvelope {
            worker_id: reader,
            event: WorkerEvent::Completed,
        });
        assert_eq!(
            commands.recv().await,
            Some(MasterCommand::NewRange {
                data: BlockRange::new(1, 5001)
            })
        );
        master.handle_event(WorkerEnvelope {
            worker_id: reader,
            event: WorkerEvent::UpdateLastAssignedBlock { block_num: 6000 },
        });
        master.handle_event(WorkerEnvelope {
            worker_id: reader,
            event: WorkerEvent::Completed,
        });
        assert_eq!(
            commands.recv().await,
            Some(MasterCommand::NewRange {
                data: BlockRange::new(6000, 8000)
            })
        );
        master.handle_event(WorkerEnvelope {
            worker_id: reader,
            event: WorkerEvent::Completed,
        });
        assert_eq!(commands.recv().await, Some(MasterCommand::Stop));
        assert!(master.workers.is_empty());
    }

    #[tokio::test]
    async fn saved_abis_reach_the_other_deserializers() {
        let (mut master, _, _) = master();
        let (origin, mut origin_commands) = attach(&mut master, WorkerRole::Deserializer, Some("wax:blocks:1".to_string()));
        let (_, mut other_commands) = attach(&mut master, WorkerRole::Deserializer, Some("wax:blocks:1".to_string()));
        let (_, mut ingestor_commands) = attach(&mut master, WorkerRole::Ingestor, Some("wax:index_abis:1".to_string()));
        let update = AbiUpdate {
            account: "eosio.token".to_string(),
            block_num: 42,
            abi_hex: "00".to_string(),
        };
        master.handle_event(WorkerEnvelope {
            worker_id: origin,
            event: WorkerEvent::SaveAbi { data: update.clone() },
        });
        assert_eq!(
            other_commands.recv().await,
            Some(MasterCommand::UpdateAbi { data: update })
        );
        assert!(origin_commands.try_recv().is_err());
        assert!(ingestor_commands.try_recv().is_err());
        assert_eq!(master.stats.totals().abis, 1);
    }

    #[tokio::test]
    async fn pause_targets_the_ingestors_of_one_kind() {
        let (mut master, _, control) = master();
        let (actions, mut action_commands) =
            attach(&mut master, WorkerRole::Ingestor, Some("wax:index_actions:1".to_string()));
        let (_, mut delta_commands) = attach(&mut master, WorkerRole::Ingestor, Some("wax:index_deltas:1".to_string()));

        let caller = tokio::spawn(async move { control.pause_indexer(Some(RecordKind::Action)).await });
        let request = master.control_requests.recv().await.unwrap();
        master.handle_control(request);

        let Some(MasterCommand::PauseIndexer { m_id }) = action_commands.recv().await else {
            panic!("expected a pause command");
        };
        assert!(delta_commands.try_recv().is_err());
        master.handle_event(WorkerEnvelope {
            worker_id: actions,
            event: WorkerEvent::IndexerPaused { m_id },
        });
        assert_eq!(caller.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn full_queues_pause_readers_once() {
        let (mut master, fabric, _) = master();
        let (_, mut reader_commands) = attach(&mut master, WorkerRole::Reader, None);
        attach(&mut master, WorkerRole::Deserializer, Some("wax:blocks:1".to_string()));
        for _ in 0..2000 {
            fabric.publish("wax:blocks:1", vec![0]).await.unwrap();
        }

        master.check_queues().await.unwrap();
        master.check_queues().await.unwrap();
        assert_eq!(reader_commands.recv().await, Some(MasterCommand::Pause));
        assert!(reader_commands.try_recv().is_err());

        fabric.purge("wax:blocks:1").await.unwrap();
        master.check_queues().await.unwrap();
        assert_eq!(reader_commands.recv().await, Some(MasterCommand::Resume));
    }

    #[tokio::test]
    async fn crashed_workers_are_relaunched() {
        tokio::time::pause();
        let (master, _, _) = master();
        let alerts = Arc::new(RecordedAlerts::default());
        let mut master = master.with_alerts(alerts.clone());
        let (ingestor, _commands) = attach(&mut master, WorkerRole::Ingestor, Some("wax:index_blocks:1".to_string()));
        master
            .handle_exit(WorkerExit {
                worker_id: ingestor,
                result: Err(anyhow::anyhow!("connection reset")),
            })
            .await
            .unwrap();
        assert!(master.workers.is_empty());
        assert_eq!(*alerts.0.lock().unwrap(), vec![AlertKind::WorkerCrash]);

        let descriptor = master.relaunches.recv().await.unwrap();
        assert_eq!(descriptor.queue.as_deref(), Some("wax:index_blocks:1"));
        master.relaunch(descriptor).unwrap();
        let relaunched = master.workers.values().next().unwrap().descriptor.clone();
        assert_eq!(relaunched.failures, 1);
        assert_ne!(relaunched.worker_id, ingestor);

        let fatal = master
            .handle_exit(WorkerExit {
                worker_id: relaunched.worker_id,
                result: Err(FatalWorkerError("bad block".to_string()).into()),
            })
            .await;
        assert!(fatal.is_err());
    }

    #[tokio::test]
    async fn exited_consumers_hand_back_their_messages() {
        tokio::time::pause();
        let fabric = Arc::new(RecordingFabric::default());
        let (mut master, _) = master_with(test_config(""), fabric.clone(), Arc::new(fabric.inner.clone()));
        master.recover_queues().await;
        {
            let recovered = fabric.recovered.lock().unwrap();
            assert!(recovered.contains(&"wax:blocks:1".to_string()));
            assert!(recovered.contains(&"wax:live_blocks".to_string()));
            assert!(recovered.contains(&"wax:index_actions:2".to_string()));
        }

        let (reader, _reader_commands) = attach(&mut master, WorkerRole::Reader, None);
        let (deserializer, _ds_commands) = attach(&mut master, WorkerRole::Deserializer, Some("wax:blocks:1".to_string()));
        let (ingestor, _ingestor_commands) = attach(&mut master, WorkerRole::Ingestor, Some("wax:index_actions:1".to_string()));
        for worker_id in [reader, deserializer] {
            master
                .handle_exit(WorkerExit {
                    worker_id,
                    result: Ok(()),
                })
                .await
                .unwrap();
        }
        master
            .handle_exit(WorkerExit {
                worker_id: ingestor,
                result: Err(anyhow::anyhow!("ack failed")),
            })
            .await
            .unwrap();
        assert_eq!(
            *fabric.released.lock().unwrap(),
            vec![
                ("wax:blocks:1".to_string(), "deserializer-1".to_string()),
                ("wax:index_actions:1".to_string(), "ingestor-1".to_string()),
            ]
        );

        // the relaunch subscribes under the tag it crashed with
        let descriptor = master.relaunches.recv().await.unwrap();
        assert_eq!(workers::consumer_tag(&descriptor), "ingestor-1");
    }

    #[tokio::test]
    async fn pending_relaunches_count_against_the_autoscale_cap() {
        tokio::time::pause();
        let fabric = MemoryQueueFabric::default();
        let mut config = test_config("");
        config.scaling.max_autoscale = 4;
        let (mut master, _) = master_with(config, Arc::new(fabric.clone()), Arc::new(fabric.clone()));
        let queue = "wax:index_actions:1".to_string();
        let ingestors: Vec<_> = (0..4)
            .map(|_| attach(&mut master, WorkerRole::Ingestor, Some(queue.clone())))
            .collect();
        fabric.publish_batch(&queue, vec![vec![0]; 30_000]).await.unwrap();

        master
            .handle_exit(WorkerExit {
                worker_id: ingestors[0].0,
                result: Err(anyhow::anyhow!("ack failed")),
            })
            .await
            .unwrap();
        master.check_queues().await.unwrap();
        assert_eq!(master.consumers_per_queue()[&queue], 4);
        assert_eq!(master.workers.len(), 3);

        let descriptor = master.relaunches.recv().await.unwrap();
        master.relaunch(descriptor).unwrap();
        assert_eq!(master.consumers_per_queue()[&queue], 4);
        assert_eq!(master.workers.len(), 4);
    }

    #[tokio::test]
    async fn relaunches_dropped_by_a_mode_switch_stay_dropped() {
        tokio::time::pause();
        let (mut master, _, _) = master();
        let (ingestor, _commands) = attach(&mut master, WorkerRole::Ingestor, Some("wax:index_abis:1".to_string()));
        master
            .handle_exit(WorkerExit {
                worker_id: ingestor,
                result: Err(anyhow::anyhow!("connection reset")),
            })
            .await
            .unwrap();
        master.pending_relaunches.clear();
        let descriptor = master.relaunches.recv().await.unwrap();
        master.relaunch(descriptor).unwrap();
        assert!(master.workers.is_empty());
    }

    #[tokio::test]
    async fn readers_joining_during_backpressure_start_paused() {
        let (mut master, fabric, _) = master();
        let (_, mut first) = attach(&mut master, WorkerRole::Reader, None);
        attach(&mut master, WorkerRole::Deserializer, Some("wax:blocks:1".to_string()));
        fabric
            .publish_batch("wax:blocks:1", vec![vec![0]; 2000])
            .await
            .unwrap();
        master.check_queues().await.unwrap();
        assert_eq!(first.recv().await, Some(MasterCommand::Pause));

        let (_, mut relaunched) = attach(&mut master, WorkerRole::Reader, None);
        assert_eq!(relaunched.try_recv(), Ok(MasterCommand::Pause));
        let (_, mut live) = attach(&mut master, WorkerRole::ContinuousReader, None);
        assert_eq!(live.try_recv(), Ok(MasterCommand::Pause));
        let (_, mut ingestor) = attach(&mut master, WorkerRole::Ingestor, Some("wax:index_blocks:1".to_string()));
        assert!(ingestor.try_recv().is_err());

        fabric.purge("wax:blocks:1").await.unwrap();
        master.check_queues().await.unwrap();
        let (_, mut late) = attach(&mut master, WorkerRole::Reader, None);
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn chain_id_reported_by_the_api_reaches_the_workers() {
        const WAX: &str = "1064487b3cd1a897ce03ae5b6a865651747e2e152090f99c1d19d44e01aea5a4";
        let (mut master, _, _) = master();
        assert!(master.config().general.chain_id.is_none());
        master.adopt_chain_id(WAX);
        let settings = logic_deserializer::DeserializerSettings::from(master.resources.config.as_ref());
        assert_eq!(settings.chain_id.as_deref(), Some(WAX));
    }
}
