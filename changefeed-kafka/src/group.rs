use std::collections::HashMap;

use async_trait::async_trait;
use bon::Builder;
use changefeed::consumer::{CommitPolicy, GroupReader};
use changefeed::types::Record;
use consumer_group_builder::SetAtLeastOneBroker;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use tracing::{info, warn};

use crate::connection::ConnectError;
use crate::metadata::client_config;
use crate::record::record_from_message;

/// Consume a topic as a member of a consumer group.
///
/// Partitions are assigned by the group coordinator, offsets are committed according to
/// the [CommitPolicy]. With the default policy librdkafka commits in the background.
///
/// ```
/// use changefeed_kafka::ConsumerGroup;
/// use changefeed::consumer::CommitPolicy;
///
/// let group = ConsumerGroup::builder()
///     .broker("localhost:9092")
///     .topic("wikimedia-stream")
///     .group_id("my-group-id")
///     .commit_policy(CommitPolicy::AfterRead)
///     .conf("session.timeout.ms", "10000")
///     .build();
/// ```
#[derive(Builder, Debug, Clone)]
#[builder(on(String, into))]
pub struct ConsumerGroup {
    #[builder(field)]
    kafka_config: HashMap<String, String>,
    #[builder(field)]
    brokers: Vec<String>,
    /// this is a workaround to check if at least one broker was provided
    #[builder(overwritable, setters(vis = "", name = "at_least_one_broker"))]
    _at_least_one_broker: (),
    topic: String,
    group_id: String,
    #[builder(default)]
    commit_policy: CommitPolicy,
    /// Upper bound of a single fetch response in bytes
    #[builder(default = 10_000_000)]
    max_fetch_bytes: usize,
    /// Where to start if the group has no committed offset, `earliest` or `latest`
    #[builder(default = "earliest".to_owned())]
    auto_offset_reset: String,
}

impl<S: consumer_group_builder::State> ConsumerGroupBuilder<S> {
    /// Provide an additional config for the Kafka consumer.
    /// Note that `bootstrap.servers`, `group.id`, `auto.offset.reset` and the commit configs
    /// are ignored. Use the respective builder methods to supply these.
    pub fn conf(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.kafka_config.insert(key.into(), value.into());
        self
    }
    /// Add a broker URL to consume from
    pub fn broker(
        mut self,
        url: impl Into<String>,
    ) -> ConsumerGroupBuilder<SetAtLeastOneBroker<S>> {
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

impl ConsumerGroup {
    /// Create the consumer and subscribe to the topic.
    /// Partitions get assigned asynchronously once the group has rebalanced.
    pub fn join(&self) -> Result<GroupSession, ConnectError> {
        let consumer: StreamConsumer = self
            .consumer_config()
            .create()
            .map_err(ConnectError::CreateClient)?;
        consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(ConnectError::Subscribe)?;
        info!(
            topic = %self.topic,
            group_id = %self.group_id,
            commit_policy = ?self.commit_policy,
            "Joined consumer group"
        );
        Ok(GroupSession {
            consumer,
            commit_policy: self.commit_policy,
        })
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut conf = client_config(&self.brokers, &self.kafka_config);
        conf.set("group.id", &self.group_id)
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("fetch.max.bytes", self.max_fetch_bytes.max(1).to_string());
        match self.commit_policy {
            CommitPolicy::Auto { interval } => {
                conf.set("enable.auto.commit", "true")
                    .set("auto.commit.interval.ms", interval.as_millis().to_string());
            }
            CommitPolicy::AfterRead => {
                conf.set("enable.auto.commit", "false");
            }
        }
        conf
    }
}

/// An active membership created by [ConsumerGroup::join]
pub struct GroupSession {
    consumer: StreamConsumer,
    commit_policy: CommitPolicy,
}

#[async_trait]
impl GroupReader for GroupSession {
    type Error = KafkaError;

    async fn read(&mut self) -> Result<Record, KafkaError> {
        let msg = self.consumer.recv().await?;
        if self.commit_policy == CommitPolicy::AfterRead {
            self.consumer.commit_message(&msg, CommitMode::Async)?;
        }
        Ok(record_from_message(&msg))
    }

    async fn close(self) -> Result<(), KafkaError> {
        if self.commit_policy == CommitPolicy::AfterRead {
            match self.consumer.commit_consumer_state(CommitMode::Sync) {
                Ok(()) => (),
                // nothing was consumed since the last commit
                Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => (),
                Err(e) => {
                    warn!(error = %e, "Final offset commit failed");
                    self.consumer.unsubscribe();
                    return Err(e);
                }
            }
        }
        self.consumer.unsubscribe();
        Ok(())
    }
}

/// Doctests to assert some bad builders do not compile
/// see: https://stackoverflow.com/a/55327334
/// this should not compile because the broker is missing
/// ```compile_fail
/// use changefeed_kafka::ConsumerGroup;
/// ConsumerGroup::builder()
/// .topic("foobar")
/// .group_id("groupid")
/// .build();
/// ```
/// missing group id
/// ```compile_fail
/// use changefeed_kafka::ConsumerGroup;
/// ConsumerGroup::builder()
/// .topic("foobar")
/// .broker("broker.com")
/// .build();
/// ```
struct _CompileTests;
