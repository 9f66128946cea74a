//! Reading messages back from the broker.
//!
//! Two independent read paths exist: [consume_batches] reads raw batches from a single
//! partition without any group coordination, [consume_group] reads as a member of a
//! consumer group and leaves offset tracking to the broker.
mod batch;
mod group;

pub use batch::{
    consume_batches, BatchConsumeError, BatchConsumerConfig, BatchLimits, BatchReport,
    InvalidBatchLimits, PartitionReader, RecordBatch,
};
pub use group::{
    consume_group, CommitPolicy, GroupConsumeError, GroupReader, GroupReport, StopReason,
};
