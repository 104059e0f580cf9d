//! Messages exchanged between the master controller and its workers.
//!
//! Both directions are serde enums tagged by `event`, so the same values can
//! be logged as JSON or carried over an out-of-process channel unchanged.
use serde::{Deserialize, Serialize};

use crate::workers::BlockRange;

/// Identifier correlating a pause or resume request with its acknowledgement.
pub fn new_operation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AbiUpdate {
    pub account: String,
    pub block_num: u32,
    /// Packed ABI as hex; empty when the ABI was cleared.
    pub abi_hex: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DsErrorReport {
    pub block_num: u32,
    pub type_name: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ForkReport {
    pub starting_block: u32,
    pub ending_block: u32,
    pub new_id: String,
}

/// Worker to master.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Protocol ABI pushed by the history endpoint, as JSON text.
    InitAbi { data: String },
    /// Reader pushed a raw block to its stage-1 queue.
    ReadBlock { block_num: u32, live: bool },
    /// Deserializer finished a block.
    ConsumedBlock {
        block_num: u32,
        block_id: String,
        producer: String,
        lib: u32,
        live: bool,
    },
    /// Reader drained its assigned range and wants another one.
    Completed,
    /// First block served is ahead of the requested range.
    UpdateLastAssignedBlock { block_num: u32 },
    DsReport { actions: u64, deltas: u64 },
    DsError { data: DsErrorReport },
    /// Indexer acknowledged `size` records as durably written.
    AddIndex { size: u64 },
    SaveAbi { data: AbiUpdate },
    ForkEvent { data: ForkReport },
    /// Continuous reader noticed a new last irreversible block.
    Lib { block_num: u32 },
    #[serde(rename = "indexer-paused")]
    IndexerPaused {
        #[serde(rename = "mId")]
        m_id: String,
    },
    #[serde(rename = "indexer-resumed")]
    IndexerResumed {
        #[serde(rename = "mId")]
        m_id: String,
    },
    #[serde(rename = "indexer-stopped")]
    IndexerStopped {
        #[serde(rename = "mId")]
        m_id: String,
    },
}

/// Master to worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MasterCommand {
    NewRange { data: BlockRange },
    Pause,
    Resume,
    /// Throttle ingestion by sleeping `delay` ms between acks while `state` holds.
    SetDelay { state: bool, delay: u64 },
    /// Reconnect to the next configured history endpoint.
    NextServer,
    Stop,
    #[serde(rename = "pause-indexer")]
    PauseIndexer {
        #[serde(rename = "mId")]
        m_id: String,
    },
    #[serde(rename = "resume-indexer")]
    ResumeIndexer {
        #[serde(rename = "mId")]
        m_id: String,
    },
    #[serde(rename = "stop-indexer")]
    StopIndexer {
        #[serde(rename = "mId")]
        m_id: String,
    },
    UpdateAbi { data: AbiUpdate },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerEnvelope {
    pub worker_id: usize,
    #[serde(flatten)]
    pub event: WorkerEvent,
}
