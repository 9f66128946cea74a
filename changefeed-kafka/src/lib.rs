//! Kafka implementations of the changefeed transports, built on rdkafka
mod connection;
mod group;
mod metadata;
mod record;

pub use connection::{
    ConnectError, PartitionConnection, PartitionConsumer, PartitionProducer, StartOffset,
};
pub use group::{ConsumerGroup, GroupSession};
pub use metadata::{MetadataError, list_topics};

/// Error type of all Kafka transports
pub use rdkafka::error::KafkaError;
