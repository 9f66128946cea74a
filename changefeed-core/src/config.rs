//! Environment configuration.
//!
//! Loaded once by the binary and turned into the explicit config structs each component
//! takes. Nothing in this crate reads the environment on its own.
use std::time::Duration;

use envconfig::Envconfig;
use url::Url;

use crate::consumer::{BatchConsumerConfig, CommitPolicy};
use crate::feed::FeedConfig;
use crate::publisher::{PublisherConfig, RetryConfig};

#[derive(Envconfig, Debug, Clone)]
pub struct Config {
    /// Comma separated bootstrap brokers
    #[envconfig(from = "KAFKA_BROKER", default = "localhost:9092")]
    pub brokers: String,

    /// Timeout for broker metadata requests in seconds
    #[envconfig(from = "CHANGEFEED_METADATA_TIMEOUT_SEC", default = "10")]
    pub metadata_timeout_sec: u64,

    #[envconfig(nested)]
    pub feed: FeedEnv,

    #[envconfig(nested)]
    pub producer: ProducerEnv,

    #[envconfig(nested)]
    pub consumer: ConsumerEnv,
}

#[derive(Envconfig, Debug, Clone)]
pub struct FeedEnv {
    /// Server-sent-events endpoint to read
    #[envconfig(
        from = "CHANGEFEED_FEED_URL",
        default = "https://stream.wikimedia.org/v2/stream/recentchange"
    )]
    pub url: Url,
    #[envconfig(from = "CHANGEFEED_USER_AGENT", default = "changefeed/0.1")]
    pub user_agent: String,
    /// Timeout for the initial connection in seconds
    #[envconfig(from = "CHANGEFEED_CONNECT_TIMEOUT_SEC", default = "10")]
    pub connect_timeout_sec: u64,
}

#[derive(Envconfig, Debug, Clone)]
pub struct ProducerEnv {
    /// max events between feed reader and publisher
    #[envconfig(from = "CHANGEFEED_CHANNEL_CAPACITY", default = "1024")]
    pub channel_capacity: usize,
    /// Deadline of a single write attempt in seconds
    #[envconfig(from = "CHANGEFEED_WRITE_TIMEOUT_SEC", default = "10")]
    pub write_timeout_sec: u64,
    /// Retries of a failed write before giving up
    #[envconfig(from = "CHANGEFEED_WRITE_RETRIES", default = "3")]
    pub write_retries: usize,
}

#[derive(Envconfig, Debug, Clone)]
pub struct ConsumerEnv {
    /// Deadline of a single batch fetch in seconds
    #[envconfig(from = "CHANGEFEED_READ_TIMEOUT_SEC", default = "60")]
    pub read_timeout_sec: u64,
    /// Interval of background offset commits for group consumers
    #[envconfig(from = "CHANGEFEED_AUTO_COMMIT_INTERVAL_MS", default = "5000")]
    pub auto_commit_interval_ms: u64,
    /// Where a group without committed offsets starts, `earliest` or `latest`
    #[envconfig(from = "CHANGEFEED_AUTO_OFFSET_RESET", default = "earliest")]
    pub auto_offset_reset: String,
}

impl Config {
    /// Broker addresses, empty entries dropped
    pub fn broker_list(&self) -> Vec<String> {
        self.brokers
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_sec)
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig::builder()
            .url(self.feed.url.clone())
            .user_agent(self.feed.user_agent.clone())
            .connect_timeout(Duration::from_secs(self.feed.connect_timeout_sec))
            .build()
    }

    /// Publisher settings, value format and key left at their defaults
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig::builder()
            .write_timeout(Duration::from_secs(self.producer.write_timeout_sec))
            .retry(
                RetryConfig::builder()
                    .max_retries(self.producer.write_retries)
                    .build(),
            )
            .build()
    }

    pub fn batch_consumer_config(&self) -> BatchConsumerConfig {
        BatchConsumerConfig::builder()
            .read_timeout(Duration::from_secs(self.consumer.read_timeout_sec))
            .build()
    }

    /// Commit policy for group consumers, `manual` switches background commits off
    pub fn commit_policy(&self, manual: bool) -> CommitPolicy {
        if manual {
            CommitPolicy::AfterRead
        } else {
            CommitPolicy::Auto {
                interval: Duration::from_millis(self.consumer.auto_commit_interval_ms),
            }
        }
    }
}
