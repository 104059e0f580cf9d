mod ipc;
mod queues;
mod records;
mod workers;

pub use ipc::{
    new_operation_id, AbiUpdate, DsErrorReport, ForkReport, MasterCommand, WorkerEnvelope,
    WorkerEvent,
};
pub use queues::{QueueDescriptor, QueueNames};
pub use records::{
    AbiRecord, AccountAuthSequence, Act, ActionReceipt, ActionTrace, Block, FailedTrx,
    IndexRecord, PermissionLevel, RecordKind, TableDelta, TableStateRow,
};
pub use workers::{BlockRange, WorkerDescriptor, WorkerRole};
