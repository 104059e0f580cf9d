//! Reader workers: stream raw block results from a history endpoint into
//! the stage-1 queues. Catch-up readers walk ranges handed out by the
//! master, the continuous reader follows the head.
use std::collections::VecDeque;
use std::time::Duration;

use ship_client::{BlocksRequest, BlocksResult, ShipConnection, ShipEvent, ShipResult, StateHistorySocket, StatusResult};
use ship_primitives::{BlockRange, ForkReport, MasterCommand, WorkerEvent, WorkerRole};
use tokio::sync::mpsc;

use super::{WorkerContext, WorkerEvents, WorkerResources};
use crate::metrics;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

enum SessionEnd {
    Stop,
    NextServer,
    Disconnected,
}

struct Reader {
    resources: WorkerResources,
    events: WorkerEvents,
    socket: StateHistorySocket,
    live: bool,
    initial_range: Option<BlockRange>,
    initialized: bool,
    ranges: VecDeque<BlockRange>,
    current: Option<BlockRange>,
    awaiting_range: bool,
    /// Last block pushed to a stage-1 queue.
    local_block: u32,
    first_available_block: u32,
    paused: bool,
    pending_acks: u32,
    delay: Option<Duration>,
    next_queue: usize,
    last_irreversible: u32,
}

#[cfg_attr(feature = "tracing-instrumentation", tracing::instrument(skip_all))]
pub(crate) async fn run(context: WorkerContext, resources: WorkerResources) -> anyhow::Result<()> {
    let WorkerContext {
        descriptor,
        mut commands,
        events,
    } = context;
    let socket = StateHistorySocket::from_validated(
        &resources.servers,
        Some(resources.config.general.max_ws_payload_mb),
    )?;
    let mut reader = Reader {
        socket,
        events,
        live: descriptor.role == WorkerRole::ContinuousReader,
        initial_range: descriptor.range,
        initialized: false,
        ranges: VecDeque::new(),
        current: None,
        awaiting_range: false,
        local_block: 0,
        first_available_block: 0,
        paused: false,
        pending_acks: 0,
        delay: None,
        next_queue: 0,
        last_irreversible: 0,
        resources,
    };
    tracing::info!(
        target: crate::INDEXER,
        "{} #{} starting with range {:?}",
        descriptor.role,
        descriptor.worker_id,
        descriptor.range
    );
    reader.run(&mut commands).await
}

impl Reader {
    async fn run(&mut self, commands: &mut mpsc::UnboundedReceiver<MasterCommand>) -> anyhow::Result<()> {
        // a graceful close ends the loop
        while self.socket.retry_on_disconnect() {
            let mut connection = match self.socket.connect().await {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::warn!(
                        target: crate::INDEXER,
                        "Failed to connect to {}: {}",
                        self.socket.active_endpoint(),
                        err
                    );
                    self.socket.use_next_ship();
                    if self.wait_before_reconnect(commands).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            // credits withheld on a previous connection died with it
            self.pending_acks = 0;
            self.events.emit(WorkerEvent::InitAbi {
                data: connection.protocol().json().to_string(),
            });

            let outcome = match connection.send_status_request().await {
                Ok(()) => self.session(&mut connection, commands).await,
                Err(err) => Err(err.into()),
            };
            match outcome {
                Ok(SessionEnd::Stop) => self.socket.close(connection, true).await,
                Ok(SessionEnd::NextServer) => {
                    self.socket.close(connection, false).await;
                    self.socket.use_next_ship();
                }
                Ok(SessionEnd::Disconnected) => {
                    self.socket.use_next_ship();
                    if self.wait_before_reconnect(commands).await {
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::warn!(target: crate::INDEXER, "Reader session failed: {:#}", err);
                    self.socket.close(connection, false).await;
                    self.socket.use_next_ship();
                    if self.wait_before_reconnect(commands).await {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Sleeps the reconnect delay, still honouring commands. Returns true
    /// when the reader was told to stop.
    async fn wait_before_reconnect(&mut self, commands: &mut mpsc::UnboundedReceiver<MasterCommand>) -> bool {
        let sleep = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = commands.recv() => {
                    let Some(command) = command else {
                        return true;
                    };
                    match self.handle_command(command, None).await {
                        Ok(Some(SessionEnd::Stop)) => return true,
                        Ok(_) => {}
                        Err(err) => tracing::warn!(target: crate::INDEXER, "{:#}", err),
                    }
                }
            }
        }
    }

    async fn session(
        &mut self,
        connection: &mut ShipConnection,
        commands: &mut mpsc::UnboundedReceiver<MasterCommand>,
    ) -> anyhow::Result<SessionEnd> {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        return Ok(SessionEnd::Stop);
                    };
                    if let Some(end) = self.handle_command(command, Some(&mut *connection)).await? {
                        return Ok(end);
                    }
                }
                event = connection.next_event() => match event {
                    ShipEvent::Message(frame) => self.handle_frame(&frame, connection).await?,
                    ShipEvent::Disconnected => return Ok(SessionEnd::Disconnected),
                    ShipEvent::Error(err) => return Err(err.into()),
                }
            }
        }
    }

    async fn handle_command(
        &mut self,
        command: MasterCommand,
        connection: Option<&mut ShipConnection>,
    ) -> anyhow::Result<Option<SessionEnd>> {
        match command {
            MasterCommand::NewRange { data } => {
                tracing::debug!(target: crate::INDEXER, "New range {:?}", data);
                self.enqueue_range(data);
                if let Some(connection) = connection {
                    if self.initialized && self.is_between_ranges() {
                        self.start_next_range(connection).await?;
                    }
                }
            }
            MasterCommand::Pause => {
                if !self.paused {
                    tracing::info!(target: crate::INDEXER, "Reader paused at block {}", self.local_block);
                }
                self.paused = true;
            }
            MasterCommand::Resume => {
                if self.paused {
                    tracing::info!(target: crate::INDEXER, "Reader resumed at block {}", self.local_block);
                }
                self.paused = false;
                if let Some(connection) = connection {
                    if self.pending_acks > 0 {
                        connection.ack(self.pending_acks).await?;
                        self.pending_acks = 0;
                    }
                    if self.initialized && !self.live && self.is_between_ranges() {
                        self.start_next_range(connection).await?;
                    }
                }
            }
            MasterCommand::SetDelay { state, delay } => {
                self.delay = state.then(|| Duration::from_millis(delay));
            }
            MasterCommand::NextServer => return Ok(Some(SessionEnd::NextServer)),
            MasterCommand::Stop => return Ok(Some(SessionEnd::Stop)),
            other => {
                tracing::debug!(target: crate::INDEXER, "Reader ignores {:?}", other);
            }
        }
        Ok(None)
    }

    fn request(&self, first_block: u32, last_block: u32) -> BlocksRequest {
        let indexer_config = &self.resources.config.indexer;
        let request = BlocksRequest::new(first_block, last_block, self.resources.config.prefetch.read);
        if indexer_config.abi_scan_mode {
            request.fetch(false, false, true)
        } else {
            request.fetch(
                indexer_config.fetch_block,
                indexer_config.fetch_traces,
                indexer_config.fetch_deltas,
            )
        }
    }

    /// Splits an assigned range into request sized pieces. Ranges that start
    /// before the first available block are clamped; a range that lies
    /// entirely before it moves the master's frontier instead.
    fn enqueue_range(&mut self, range: BlockRange) {
        let first_block = range.first_block.max(self.first_available_block);
        if first_block > range.first_block && first_block >= range.last_block {
            tracing::warn!(
                target: crate::INDEXER,
                "Range {:?} is not available, first available block is {}",
                range,
                self.first_available_block
            );
            self.events.emit(WorkerEvent::UpdateLastAssignedBlock {
                block_num: self.first_available_block,
            });
        }
        let batch = u32::try_from(self.resources.config.scaling.batch_size)
            .unwrap_or(u32::MAX);
        self.ranges
            .extend(BlockRange::split(first_block, range.last_block, batch));
    }

    async fn start_next_range(&mut self, connection: &mut ShipConnection) -> anyhow::Result<()> {
        if self.paused {
            return Ok(());
        }
        match self.ranges.pop_front() {
            Some(range) => {
                self.current = Some(range);
                self.awaiting_range = false;
                self.local_block = range.first_block.saturating_sub(1);
                connection
                    .request_blocks(&self.request(range.first_block, range.last_block))
                    .await?;
            }
            None => {
                self.current = None;
                if !self.awaiting_range {
                    self.awaiting_range = true;
                    self.events.emit(WorkerEvent::Completed);
                }
            }
        }
        Ok(())
    }

    async fn handle_status(&mut self, status: StatusResult, connection: &mut ShipConnection) -> anyhow::Result<()> {
        self.first_available_block = status.first_available_block();
        tracing::debug!(
            target: crate::INDEXER,
            "History available from block {} to {}",
            self.first_available_block,
            status.head.block_num
        );

        if self.live {
            let first_block = if self.local_block > 0 {
                self.local_block + 1
            } else {
                self.initial_range
                    .map(|range| range.first_block)
                    .unwrap_or(status.head.block_num)
                    .max(self.first_available_block)
            };
            self.initialized = true;
            connection.request_blocks(&self.request(first_block, u32::MAX)).await?;
            return Ok(());
        }

        if !self.initialized {
            self.initialized = true;
            if let Some(range) = self.initial_range {
                self.enqueue_range(range);
            }
            return self.start_next_range(connection).await;
        }

        // reconnect: pick up the interrupted range right after the last
        // block that reached the queues
        match self.current {
            Some(range) if self.local_block + 1 < range.last_block => {
                connection
                    .request_blocks(&self.request(self.local_block + 1, range.last_block))
                    .await?;
                Ok(())
            }
            _ => self.start_next_range(connection).await,
        }
    }

    async fn handle_frame(&mut self, frame: &[u8], connection: &mut ShipConnection) -> anyhow::Result<()> {
        let protocol = connection.protocol();
        match protocol.decode_result(frame)? {
            ShipResult::Status(status) => self.handle_status(status, connection).await,
            ShipResult::Blocks(result) => {
                self.handle_blocks(&result, frame).await?;
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                if self.paused {
                    self.pending_acks += 1;
                } else {
                    connection.ack(1).await?;
                }
                if !self.live && !self.paused && self.range_is_done() {
                    self.start_next_range(connection).await?;
                }
                Ok(())
            }
            ShipResult::Unknown(name) => {
                tracing::debug!(target: crate::INDEXER, "Ignoring {} result", name);
                Ok(())
            }
        }
    }

    fn range_is_done(&self) -> bool {
        matches!(self.current, Some(range) if self.local_block + 1 >= range.last_block)
    }

    fn is_between_ranges(&self) -> bool {
        self.current.is_none() || self.range_is_done()
    }

    fn next_block_queue(&mut self) -> String {
        let queues = self.resources.config.scaling.ds_queues.max(1);
        self.next_queue = self.next_queue % queues + 1;
        self.resources.names.blocks(self.next_queue)
    }

    async fn handle_blocks(&mut self, result: &BlocksResult<'_>, frame: &[u8]) -> anyhow::Result<()> {
        let Some(this_block) = &result.this_block else {
            return Ok(());
        };
        let block_num = this_block.block_num;

        if self.live {
            if self.local_block > 0 && block_num <= self.local_block {
                tracing::warn!(
                    target: crate::INDEXER,
                    "Fork detected at block {}, dropping up to {}",
                    block_num,
                    self.local_block
                );
                self.events.emit(WorkerEvent::ForkEvent {
                    data: ForkReport {
                        starting_block: block_num,
                        ending_block: self.local_block,
                        new_id: this_block.block_id.clone(),
                    },
                });
            }
            let lib = result.last_irreversible.block_num;
            if lib > self.last_irreversible {
                self.last_irreversible = lib;
                self.events.emit(WorkerEvent::Lib { block_num: lib });
            }
            self.resources
                .fabric
                .publish(&self.resources.names.live_blocks(), frame.to_vec())
                .await?;
        } else {
            if block_num != self.local_block + 1 {
                tracing::warn!(
                    target: crate::INDEXER,
                    "Out of order block {} (expected {}), skipped",
                    block_num,
                    self.local_block + 1
                );
                return Ok(());
            }
            let queue = self.next_block_queue();
            self.resources.fabric.publish(&queue, frame.to_vec()).await?;
        }

        self.local_block = block_num;
        metrics::BLOCKS_READ_TOTAL.inc();
        self.events.emit(WorkerEvent::ReadBlock {
            block_num,
            live: self.live,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::test_utils::{test_config, test_context, test_resources};
    use futures::{SinkExt, StreamExt};
    use queue_fabric::MemoryQueueFabric;
    use ship_client::{ShipEndpoint, ShipProtocol, ValidatedShipServer};
    use ship_primitives::WorkerDescriptor;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Message;

    const SHIP_ABI: &str = include_str!("../../../ship-client/tests/fixtures/ship_abi.json");

    fn block_id(num: u32) -> String {
        format!("{:08x}{}", num, "0".repeat(56))
    }

    fn position(num: u32) -> serde_json::Value {
        serde_json::json!({"block_num": num, "block_id": block_id(num)})
    }

    /// History endpoint with blocks 2 to 500 that streams every requested
    /// block without waiting for acks.
    async fn spawn_history_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let protocol = ShipProtocol::from_json(SHIP_ABI).unwrap();
            while let Ok((stream, _)) = listener.accept().await {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                ws.send(Message::Text(SHIP_ABI.into())).await.unwrap();
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Binary(data) = message else {
                        continue;
                    };
                    let request = protocol.abi().decode("request", &data).unwrap();
                    let results = match request[0].as_str().unwrap() {
                        "get_status_request_v0" => vec![serde_json::json!(["get_status_result_v0", {
                            "head": position(500),
                            "last_irreversible": position(400),
                            "trace_begin_block": 2,
                            "trace_end_block": 500,
                            "chain_state_begin_block": 1,
                            "chain_state_end_block": 500,
                            "chain_id": format!("{:0<64}", "abc")
                        }])],
                        "get_blocks_request_v0" => {
                            let start = request[1]["start_block_num"].as_u64().unwrap() as u32;
                            let end = request[1]["end_block_num"].as_u64().unwrap() as u32;
                            (start..end)
                                .map(|num| {
                                    serde_json::json!(["get_blocks_result_v0", {
                                        "head": position(500),
                                        "last_irreversible": position(400),
                                        "this_block": position(num),
                                        "prev_block": position(num - 1),
                                        "block": "00",
                                        "traces": "00",
                                        "deltas": "00"
                                    }])
                                })
                                .collect()
                        }
                        _ => vec![],
                    };
                    for result in results {
                        let frame = protocol.abi().encode("result", &result).unwrap();
                        ws.send(Message::Binary(frame.into())).await.unwrap();
                    }
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn reads_the_available_part_of_a_range() {
        let url = spawn_history_node().await;
        let mut config = test_config("");
        config.scaling.batch_size = 3;
        config.scaling.ds_queues = 2;
        let fabric = MemoryQueueFabric::default();
        let storage = Arc::new(database::MemoryDbManager::with_prefix("wax"));
        let mut resources = test_resources(config, fabric.clone(), storage);
        resources.servers = Arc::new(vec![ValidatedShipServer {
            node: ShipEndpoint::new("local", url),
            chain_id: format!("{:0<64}", "abc"),
            active: true,
            trace_begin_block: 2,
            trace_end_block: 500,
            chain_state_begin_block: 1,
        }]);

        let descriptor = WorkerDescriptor::new(1, WorkerRole::Reader, 1).with_range(BlockRange::new(1, 6));
        let (context, commands, mut events) = test_context(descriptor);
        let reader = tokio::spawn(run(context, resources));

        let mut read = vec![];
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            match envelope.event {
                WorkerEvent::ReadBlock { block_num, live } => {
                    assert!(!live);
                    read.push(block_num);
                }
                WorkerEvent::Completed => break,
                _ => {}
            }
        }
        assert_eq!(read, vec![2, 3, 4, 5]);
        assert_eq!(fabric.ready_count("wax:blocks:1"), 2);
        assert_eq!(fabric.ready_count("wax:blocks:2"), 2);

        commands.send(MasterCommand::Stop).unwrap();
        reader.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn paused_reader_waits_for_resume_before_the_next_range() {
        let url = spawn_history_node().await;
        let mut config = test_config("");
        config.scaling.batch_size = 2;
        let fabric = MemoryQueueFabric::default();
        let storage = Arc::new(database::MemoryDbManager::with_prefix("wax"));
        let mut resources = test_resources(config, fabric.clone(), storage);
        resources.servers = Arc::new(vec![ValidatedShipServer {
            node: ShipEndpoint::new("local", url),
            chain_id: format!("{:0<64}", "abc"),
            active: true,
            trace_begin_block: 2,
            trace_end_block: 500,
            chain_state_begin_block: 1,
        }]);

        let descriptor = WorkerDescriptor::new(1, WorkerRole::Reader, 1);
        let (context, commands, mut events) = test_context(descriptor);
        let reader = tokio::spawn(run(context, resources));
        // the first status answer completes the empty initial assignment
        loop {
            let envelope = events.recv().await.unwrap();
            if envelope.event == WorkerEvent::Completed {
                break;
            }
        }

        commands.send(MasterCommand::Pause).unwrap();
        commands
            .send(MasterCommand::NewRange {
                data: BlockRange::new(10, 14),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fabric.ready_count("wax:blocks:1"), 0);

        commands.send(MasterCommand::Resume).unwrap();
        let mut read = vec![];
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            match envelope.event {
                WorkerEvent::ReadBlock { block_num, .. } => read.push(block_num),
                WorkerEvent::Completed => break,
                _ => {}
            }
        }
        assert_eq!(read, vec![10, 11, 12, 13]);

        commands.send(MasterCommand::Stop).unwrap();
        reader.await.unwrap().unwrap();
    }
}
