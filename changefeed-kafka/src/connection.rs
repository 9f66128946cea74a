use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use changefeed::consumer::{BatchLimits, PartitionReader, RecordBatch};
use changefeed::publisher::PartitionWriter;
use changefeed::types::WireMessage;
use futures::FutureExt;
use partition_connection_builder::SetAtLeastOneBroker;
use rdkafka::Message as _;
use rdkafka::Offset;
use rdkafka::TopicPartitionList;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use thiserror::Error;
use tracing::{debug, info};

use crate::metadata::{MetadataError, TopicInfo, client_config, fetch_topics};

/// A connection to the leader of a single topic partition.
///
/// Dialing checks that the topic exists and the partition currently has a leader, so a bad
/// topic or partition fails right away instead of on the first write.
///
/// # Usage
///
/// Custom [rdkafka configuration](https://github.com/confluentinc/librdkafka/blob/master/CONFIGURATION.md)
/// can be provided by calling `.conf(key, value)`.
///
/// ```
/// use changefeed_kafka::PartitionConnection;
///
/// let connection = PartitionConnection::builder()
///     .broker("localhost:9092") // at least one broker must be provided
///     .topic("wikimedia-stream")
///     .partition(0)
///     .conf("log_level", "3")
///     .build();
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(on(String, into))]
pub struct PartitionConnection {
    #[builder(field)]
    kafka_config: HashMap<String, String>,
    #[builder(field)]
    brokers: Vec<String>,
    /// this is a workaround to check if at least one broker was provided
    #[builder(overwritable, setters(vis = "", name = "at_least_one_broker"))]
    _at_least_one_broker: (),
    topic: String,
    #[builder(default)]
    partition: i32,
    /// Timeout for fetching Kafka Broker metadata
    #[builder(default = Duration::from_secs(10))]
    metadata_timeout: Duration,
}

impl<S: partition_connection_builder::State> PartitionConnectionBuilder<S> {
    /// Provide an additional config for the Kafka client.
    /// Note that `bootstrap.servers` is ignored, use [Self::broker] to supply it.
    pub fn conf(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kafka_config.insert(key.into(), value.into());
        self
    }
    /// Add a broker URL to connect to
    pub fn broker(
        mut self,
        url: impl Into<String>,
    ) -> PartitionConnectionBuilder<SetAtLeastOneBroker<S>> {
        self.brokers.push(url.into());
        self.at_least_one_broker(())
    }
    /// Add further broker URLs, this does not replace the first call to [Self::broker]
    pub fn brokers<I, U>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        self.brokers.extend(urls.into_iter().map(Into::into));
        self
    }
}

/// Where a [PartitionConsumer] starts reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartOffset {
    /// Oldest retained record
    #[default]
    Beginning,
    /// Only records produced after connecting
    End,
}

impl PartitionConnection {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Open the write side. `write_timeout` bounds local queueing and delivery of each message.
    pub async fn dial_writer(
        &self,
        write_timeout: Duration,
    ) -> Result<PartitionProducer, ConnectError> {
        self.ensure_leader().await?;
        let producer: FutureProducer = self
            .producer_config(write_timeout)
            .create()
            .map_err(ConnectError::CreateClient)?;
        info!(topic = %self.topic, partition = self.partition, "Connected partition writer");
        Ok(PartitionProducer {
            producer,
            topic: self.topic.clone(),
            partition: self.partition,
            queue_timeout: write_timeout,
            flush_timeout: write_timeout,
        })
    }

    /// Open the read side, positioned at `start`.
    /// `limits` are passed on to the broker as fetch size hints.
    pub async fn dial_reader(
        &self,
        start: StartOffset,
        limits: BatchLimits,
    ) -> Result<PartitionConsumer, ConnectError> {
        self.ensure_leader().await?;
        let consumer: StreamConsumer = self
            .consumer_config(limits)
            .create()
            .map_err(ConnectError::CreateClient)?;
        let offset = match start {
            StartOffset::Beginning => Offset::Beginning,
            StartOffset::End => Offset::End,
        };
        let mut topic_partitions = TopicPartitionList::with_capacity(1);
        topic_partitions
            .add_partition_offset(&self.topic, self.partition, offset)
            .map_err(ConnectError::Assign)?;
        consumer
            .assign(&topic_partitions)
            .map_err(ConnectError::Assign)?;
        info!(
            topic = %self.topic,
            partition = self.partition,
            ?start,
            "Connected partition reader"
        );
        Ok(PartitionConsumer {
            consumer,
            pending: None,
        })
    }

    async fn ensure_leader(&self) -> Result<i32, ConnectError> {
        let topics = fetch_topics(
            self.brokers.clone(),
            self.kafka_config.clone(),
            Some(self.topic.clone()),
            self.metadata_timeout,
        )
        .await?;
        let leader = partition_leader(&topics, &self.topic, self.partition)?;
        debug!(
            topic = %self.topic,
            partition = self.partition,
            leader,
            "Found partition leader"
        );
        Ok(leader)
    }

    fn producer_config(&self, write_timeout: Duration) -> ClientConfig {
        let mut conf = client_config(&self.brokers, &self.kafka_config);
        conf.set("message.timeout.ms", write_timeout.as_millis().to_string());
        conf
    }

    fn consumer_config(&self, limits: BatchLimits) -> ClientConfig {
        let mut conf = client_config(&self.brokers, &self.kafka_config);
        // required by librdkafka for any consumer, we never join the group
        conf.set("group.id", format!("changefeed-partition-{}", self.topic))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("fetch.min.bytes", limits.min_bytes.max(1).to_string())
            .set("max.partition.fetch.bytes", limits.max_bytes.max(1).to_string());
        conf
    }
}

fn partition_leader(
    topics: &[TopicInfo],
    topic: &str,
    partition: i32,
) -> Result<i32, ConnectError> {
    let info = topics
        .iter()
        .find(|t| t.name == topic)
        .ok_or_else(|| ConnectError::UnknownTopic(topic.to_owned()))?;
    if let Some(error) = &info.error {
        return Err(ConnectError::TopicError {
            topic: topic.to_owned(),
            error: error.clone(),
        });
    }
    let (_, leader) = info
        .partitions
        .iter()
        .find(|(id, _)| *id == partition)
        .ok_or_else(|| ConnectError::UnknownPartition {
            topic: topic.to_owned(),
            partition,
        })?;
    if *leader < 0 {
        return Err(ConnectError::NoLeader {
            topic: topic.to_owned(),
            partition,
        });
    }
    Ok(*leader)
}

/// Write side of a [PartitionConnection]
pub struct PartitionProducer {
    producer: FutureProducer,
    topic: String,
    partition: i32,
    queue_timeout: Duration,
    flush_timeout: Duration,
}

#[async_trait]
impl PartitionWriter for PartitionProducer {
    type Error = KafkaError;

    async fn write(&self, msg: &WireMessage) -> Result<(), KafkaError> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic)
            .partition(self.partition)
            .payload(msg.value.as_slice());
        if let Some(key) = msg.key.as_deref() {
            record = record.key(key);
        }
        self.producer
            .send(record, self.queue_timeout)
            .await
            .map(|_| ())
            .map_err(|(e, _)| e)
    }

    async fn close(self) -> Result<(), KafkaError> {
        let Self {
            producer,
            flush_timeout,
            ..
        } = self;
        // flushing blocks until all in-flight messages are acknowledged
        tokio::task::spawn_blocking(move || producer.flush(flush_timeout))
            .await
            .map_err(|_| KafkaError::Canceled)?
    }
}

/// Read side of a [PartitionConnection]
pub struct PartitionConsumer {
    consumer: StreamConsumer,
    /// payload received which did not fit into the previous batch
    pending: Option<Vec<u8>>,
}

#[async_trait]
impl PartitionReader for PartitionConsumer {
    type Error = KafkaError;

    async fn read_batch(
        &mut self,
        limits: BatchLimits,
        deadline: Duration,
    ) -> RecordBatch<KafkaError> {
        let consumer = &self.consumer;
        let next = move || async move {
            consumer
                .recv()
                .await
                .map(|msg| msg.payload().unwrap_or_default().to_vec())
        };
        let until = tokio::time::Instant::now() + deadline;
        fill_batch(next, &mut self.pending, limits.max_bytes, until).await
    }

    async fn close(self) -> Result<(), KafkaError> {
        self.consumer.unassign()
    }
}

/// Collect payloads from `next` into one batch.
///
/// Only the first payload is waited for, at most until `until`. After that the batch takes
/// whatever is immediately available and returns, so a small record is never held back
/// waiting for more bytes. `fetch.min.bytes` already makes the broker wait for data.
/// A payload which would push the batch over `max_bytes` is parked in `pending` and starts
/// the next batch. A single payload larger than `max_bytes` makes up a batch on its own.
async fn fill_batch<F, Fut, E>(
    mut next: F,
    pending: &mut Option<Vec<u8>>,
    max_bytes: usize,
    until: tokio::time::Instant,
) -> RecordBatch<E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<u8>, E>>,
{
    let mut records = Vec::new();
    let mut bytes = 0;
    if let Some(payload) = pending.take() {
        bytes += payload.len();
        records.push(payload);
    }
    while bytes < max_bytes.max(1) {
        let received = if records.is_empty() {
            match tokio::time::timeout_at(until, next()).await {
                Ok(received) => received,
                Err(_elapsed) => break,
            }
        } else {
            match next().now_or_never() {
                Some(received) => received,
                None => break,
            }
        };
        let payload = match received {
            Ok(payload) => payload,
            Err(e) => return RecordBatch::new(records, Some(e)),
        };
        if payload.is_empty() {
            continue;
        }
        if !records.is_empty() && bytes + payload.len() > max_bytes {
            *pending = Some(payload);
            break;
        }
        bytes += payload.len();
        records.push(payload);
    }
    RecordBatch::new(records, None)
}

/// Possible errors when opening a connection
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("Failed to create Kafka client")]
    CreateClient(#[source] KafkaError),
    #[error("Topic `{0}` does not exist")]
    UnknownTopic(String),
    #[error("Broker reported an error for topic `{topic}`: {error}")]
    TopicError { topic: String, error: String },
    #[error("Topic `{topic}` has no partition {partition}")]
    UnknownPartition { topic: String, partition: i32 },
    #[error("Partition {partition} of topic `{topic}` has no leader")]
    NoLeader { topic: String, partition: i32 },
    #[error("Could not assign topic-partition to consumer")]
    Assign(#[source] KafkaError),
    #[error("Could not subscribe to topic")]
    Subscribe(#[source] KafkaError),
}

/// Doctests to assert some bad builders do not compile
/// see: https://stackoverflow.com/a/55327334
/// this should not compile because the broker is missing
/// ```compile_fail
/// use changefeed_kafka::PartitionConnection;
/// PartitionConnection::builder()
/// .topic("foobar")
/// .build();
/// ```
/// missing topic
/// ```compile_fail
/// use changefeed_kafka::PartitionConnection;
/// PartitionConnection::builder()
/// .broker("broker.com")
/// .build();
/// ```
struct _CompileTests;
