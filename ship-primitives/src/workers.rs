use serde::{Deserialize, Serialize};

/// Half-open block range `[first_block, last_block)`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub first_block: u32,
    pub last_block: u32,
}

impl BlockRange {
    pub fn new(first_block: u32, last_block: u32) -> Self {
        Self {
            first_block,
            last_block,
        }
    }

    pub fn len(&self) -> u32 {
        self.last_block.saturating_sub(self.first_block)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, block_num: u32) -> bool {
        (self.first_block..self.last_block).contains(&block_num)
    }

    /// Splits `[start, end)` into consecutive ranges of at most `batch` blocks.
    pub fn split(start: u32, end: u32, batch: u32) -> Vec<BlockRange> {
        let batch = batch.max(1);
        let mut ranges = vec![];
        let mut first = start;
        while first < end {
            let last = first.saturating_add(batch).min(end);
            ranges.push(BlockRange::new(first, last));
            first = last;
        }
        ranges
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    Reader,
    ContinuousReader,
    Deserializer,
    Ingestor,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self {
            WorkerRole::Reader => "reader",
            WorkerRole::ContinuousReader => "continuous_reader",
            WorkerRole::Deserializer => "deserializer",
            WorkerRole::Ingestor => "ingestor",
        };
        f.write_str(role)
    }
}

/// What the master knows about one supervised worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerDescriptor {
    pub worker_id: usize,
    pub role: WorkerRole,
    /// Queue consumed by deserializers and ingestors, or fed by readers.
    pub queue: Option<String>,
    /// Index among workers of the same role, 1-based.
    pub local_id: usize,
    pub range: Option<BlockRange>,
    pub live_mode: bool,
    pub failures: u32,
}

impl WorkerDescriptor {
    pub fn new(worker_id: usize, role: WorkerRole, local_id: usize) -> Self {
        Self {
            worker_id,
            role,
            queue: None,
            local_id,
            range: None,
            live_mode: false,
            failures: 0,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_range(mut self, range: BlockRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn live(mut self) -> Self {
        self.live_mode = true;
        self
    }
}
