use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::metadata::MetadataTopic;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;
use tokio::task::JoinError;

/// librdkafka config shared by every client we create.
/// Custom settings go first so the explicit broker list always wins.
pub(crate) fn client_config(
    brokers: &[String],
    extra_conf: &HashMap<String, String>,
) -> ClientConfig {
    let mut kafka_conf = ClientConfig::new();
    for (k, v) in extra_conf.iter() {
        kafka_conf.set(k, v);
    }
    kafka_conf.set("bootstrap.servers", brokers.join(","));
    kafka_conf
}

/// The part of a topic's metadata we care about
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TopicInfo {
    pub(crate) name: String,
    /// Broker reported error for this topic, e.g. it does not exist
    pub(crate) error: Option<String>,
    /// `(partition id, leader broker id)`, leader is `-1` if there is none
    pub(crate) partitions: Vec<(i32, i32)>,
}

impl From<&MetadataTopic> for TopicInfo {
    fn from(topic: &MetadataTopic) -> Self {
        Self {
            name: topic.name().to_owned(),
            error: topic.error().map(|e| RDKafkaErrorCode::from(e).to_string()),
            partitions: topic
                .partitions()
                .iter()
                .map(|p| (p.id(), p.leader()))
                .collect(),
        }
    }
}

/// Fetch metadata for one topic or, with `None`, for all topics.
/// The request blocks, so it runs on the blocking pool.
pub(crate) async fn fetch_topics(
    brokers: Vec<String>,
    extra_conf: HashMap<String, String>,
    topic: Option<String>,
    timeout: Duration,
) -> Result<Vec<TopicInfo>, MetadataError> {
    tokio::task::spawn_blocking(move || {
        let consumer: BaseConsumer = client_config(&brokers, &extra_conf)
            .create()
            .map_err(MetadataError::CreateClient)?;
        let metadata = consumer
            .fetch_metadata(topic.as_deref(), timeout)
            .map_err(MetadataError::Fetch)?;
        Ok(metadata.topics().iter().map(TopicInfo::from).collect())
    })
    .await
    .map_err(MetadataError::Task)?
}

/// Names of all topics known to the cluster, sorted
pub async fn list_topics(
    brokers: &[String],
    timeout: Duration,
) -> Result<Vec<String>, MetadataError> {
    let topics = fetch_topics(brokers.to_vec(), HashMap::new(), None, timeout).await?;
    Ok(topic_names(&topics))
}

fn topic_names(topics: &[TopicInfo]) -> Vec<String> {
    topics
        .iter()
        .filter(|t| t.error.is_none())
        .map(|t| t.name.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Possible errors when reading cluster metadata
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to create Kafka client")]
    CreateClient(#[source] rdkafka::error::KafkaError),
    #[error("Failed to fetch metadata from Kafka broker")]
    Fetch(#[source] rdkafka::error::KafkaError),
    #[error("Metadata task failed")]
    Task(#[source] JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str, error: Option<&str>) -> TopicInfo {
        TopicInfo {
            name: name.to_owned(),
            error: error.map(str::to_owned),
            partitions: vec![(0, 1)],
        }
    }

    #[test]
    fn names_sorted_unique_without_errors() {
        let topics = [
            topic("wikimedia", None),
            topic("__consumer_offsets", None),
            topic("broken", Some("Broker: Unknown topic or partition")),
            topic("alpha", None),
            topic("wikimedia", None),
        ];
        assert_eq!(
            topic_names(&topics),
            vec!["__consumer_offsets", "alpha", "wikimedia"]
        );
    }

    #[test]
    fn broker_list_overrides_custom_conf() {
        let extra = HashMap::from([
            ("bootstrap.servers".to_owned(), "ignored:1".to_owned()),
            ("log_level".to_owned(), "3".to_owned()),
        ]);
        let conf = client_config(&["a:9092".to_owned(), "b:9092".to_owned()], &extra);
        assert_eq!(conf.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(conf.get("log_level"), Some("3"));
    }
}
