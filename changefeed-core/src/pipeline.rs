//! Feed to partition: the reader task and the publisher joined by a bounded channel
use bon::Builder;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::feed::{FeedConfig, FeedError, FeedReader, ReadReport};
use crate::publisher::{PartitionWriter, PublishError, PublishReport, Publisher, PublisherConfig};

/// Everything needed to run the feed into one partition
#[derive(Builder, Debug, Clone)]
pub struct ProducerPipeline {
    pub feed: FeedConfig,
    #[builder(default)]
    pub publisher: PublisherConfig,
    /// Events buffered between reader and publisher before the reader has to wait
    #[builder(default = 1024)]
    pub channel_capacity: usize,
}

impl ProducerPipeline {
    /// Connect the feed and publish it through `writer` until the feed ends, publishing
    /// fails or `cancel` fires.
    ///
    /// The reader runs on its own task. When the publisher stops for any reason the reader
    /// is cancelled and joined before returning.
    pub async fn run<W>(
        self,
        writer: W,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, PipelineError<W::Error>>
    where
        W: PartitionWriter,
    {
        let feed = match FeedReader::connect(&self.feed).await {
            Ok(feed) => feed,
            Err(e) => {
                // the writer is ours, release it before bailing
                if let Err(close_err) = writer.close().await {
                    error!(error = %close_err, "Failed to close partition writer");
                }
                return Err(PipelineError::Feed(e));
            }
        };

        let (tx, rx) = flume::bounded(self.channel_capacity.max(1));
        let reader_cancel = cancel.child_token();
        let reader = tokio::spawn(feed.pump(tx, reader_cancel.clone()));

        let published = Publisher::new(writer, self.publisher).run(rx, cancel).await;
        reader_cancel.cancel();
        let (read, publish) = join_halves(reader, published).await?;
        info!(
            forwarded = read.forwarded,
            published = publish.published,
            "Producer pipeline finished"
        );
        Ok(PipelineReport { read, publish })
    }
}

/// Wait for the reader task. A publish failure takes precedence over the reader failing to
/// join, the latter is only logged then.
async fn join_halves<E>(
    reader: JoinHandle<ReadReport>,
    published: Result<PublishReport, PublishError<E>>,
) -> Result<(ReadReport, PublishReport), PipelineError<E>>
where
    E: std::error::Error + 'static,
{
    let joined = reader.await;
    match (published, joined) {
        (Ok(publish), Ok(read)) => Ok((read, publish)),
        (Ok(_), Err(e)) => Err(PipelineError::ReaderTask(e)),
        (Err(e), joined) => {
            if let Err(join_err) = joined {
                error!(error = %join_err, "Feed reader task failed");
            }
            Err(PipelineError::Publish(e))
        }
    }
}

/// Combined counters of both pipeline halves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub read: ReadReport,
    pub publish: PublishReport,
}

/// Errors ending a [ProducerPipeline] run
#[derive(Debug, Error)]
pub enum PipelineError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Error reading stream")]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Publish(#[from] PublishError<E>),
    #[error("Feed reader task failed")]
    ReaderTask(#[source] JoinError),
}
