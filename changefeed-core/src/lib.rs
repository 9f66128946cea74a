//! changefeed bridges a server-sent-events change feed into a partitioned message log and
//! reads that log back.
//!
//! The crate is broker agnostic: [publisher::PartitionWriter], [consumer::PartitionReader]
//! and [consumer::GroupReader] are implemented for Kafka in `changefeed-kafka`.
pub mod config;
pub mod consumer;
pub mod decoder;
pub mod feed;
pub mod pipeline;
pub mod publisher;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;
