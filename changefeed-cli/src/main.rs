use std::process::ExitCode;

use changefeed::config::Config;
use changefeed::consumer::{
    BatchConsumeError, BatchLimits, GroupConsumeError, InvalidBatchLimits, StopReason,
    consume_batches, consume_group,
};
use changefeed::pipeline::{PipelineError, ProducerPipeline};
use changefeed_kafka::{
    ConnectError, ConsumerGroup, KafkaError, MetadataError, PartitionConnection, list_topics,
};
use envconfig::Envconfig;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Action, Parsed};

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let action = match cli::parse_from(std::env::args_os()) {
        Parsed::Run(action) => action,
        Parsed::Menu => {
            println!("{}", cli::MENU);
            return ExitCode::SUCCESS;
        }
        Parsed::UnknownAction => {
            println!("Unknown action. Please input again.\n{}", cli::MENU);
            return ExitCode::SUCCESS;
        }
        Parsed::Usage(usage) => {
            println!("{usage}");
            return ExitCode::SUCCESS;
        }
        Parsed::Clap(e) => e.exit(),
    };
    debug!("Got the following action: {action:?}");

    match main_inner(action).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", eyre::Report::new(e));
            ExitCode::FAILURE
        }
    }
}

async fn main_inner(action: Action) -> Result<(), Error> {
    if action == Action::Close {
        println!("Closing the application! Bye.");
        return Ok(());
    }
    let config = Config::init_from_env()?;
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    match action {
        Action::ListTopics => {
            let topics = list_topics(&config.broker_list(), config.metadata_timeout()).await?;
            for topic in topics {
                println!("{topic}");
            }
        }
        Action::StartProducer {
            topic,
            partition,
            format,
            key,
        } => {
            let mut publisher = config.publisher_config();
            publisher.format = format.into();
            publisher.key = key.into();
            let writer = connection(&config, topic, partition)?
                .dial_writer(publisher.write_timeout)
                .await?;
            let report = ProducerPipeline::builder()
                .feed(config.feed_config())
                .publisher(publisher)
                .channel_capacity(config.producer.channel_capacity)
                .build()
                .run(writer, cancel)
                .await?;
            info!(
                lines = report.read.lines,
                malformed = report.read.malformed,
                published = report.publish.published,
                retries = report.publish.retries,
                "Producer stopped"
            );
        }
        Action::StartConsumer {
            topic,
            partition,
            min_bytes,
            max_bytes,
            from,
        } => {
            let limits = BatchLimits::new(min_bytes, max_bytes)?;
            let mut consumer_config = config.batch_consumer_config();
            consumer_config.limits = limits;
            let reader = connection(&config, topic, partition)?
                .dial_reader(from.into(), limits)
                .await?;
            consume_batches(reader, consumer_config, cancel, |chunk| {
                println!("{}", String::from_utf8_lossy(chunk));
            })
            .await?;
        }
        Action::StartConsumerGroup {
            topic,
            group_id,
            max_bytes,
            manual_commit,
        } => {
            let (first, rest) = split_brokers(&config)?;
            let session = ConsumerGroup::builder()
                .broker(first)
                .brokers(rest)
                .topic(topic)
                .group_id(group_id)
                .commit_policy(config.commit_policy(manual_commit))
                .max_fetch_bytes(max_bytes)
                .auto_offset_reset(config.consumer.auto_offset_reset.clone())
                .build()
                .join()?;
            let report = consume_group(session, cancel, |record| println!("{record}")).await?;
            match report.stopped_by {
                StopReason::Cancelled => {
                    info!(consumed = report.consumed, "Group consumer stopped")
                }
                StopReason::ReadError(e) => warn!(
                    consumed = report.consumed,
                    error = %e,
                    "Group consumer stopped on read error"
                ),
            }
        }
        Action::Close => (),
    }
    Ok(())
}

fn split_brokers(config: &Config) -> Result<(String, Vec<String>), Error> {
    let mut brokers = config.broker_list();
    if brokers.is_empty() {
        return Err(Error::NoBrokers);
    }
    let first = brokers.remove(0);
    Ok((first, brokers))
}

fn connection(
    config: &Config,
    topic: String,
    partition: i32,
) -> Result<PartitionConnection, Error> {
    let (first, rest) = split_brokers(config)?;
    Ok(PartitionConnection::builder()
        .broker(first)
        .brokers(rest)
        .topic(topic)
        .partition(partition)
        .metadata_timeout(config.metadata_timeout())
        .build())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl-C, shutting down");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "Unable to listen for Ctrl-C"),
    }
}

#[derive(Error, Debug)]
enum Error {
    #[error("Invalid configuration")]
    Config(#[from] envconfig::Error),
    #[error("KAFKA_BROKER does not contain any broker")]
    NoBrokers,
    #[error("Failed to list topics")]
    Metadata(#[from] MetadataError),
    #[error("Failed to connect to Kafka")]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Limits(#[from] InvalidBatchLimits),
    #[error("Producer failed")]
    Producer(#[from] PipelineError<KafkaError>),
    #[error("Consumer failed")]
    Consumer(#[from] BatchConsumeError<KafkaError>),
    #[error("Group consumer failed")]
    GroupConsumer(#[from] GroupConsumeError<KafkaError>),
}
