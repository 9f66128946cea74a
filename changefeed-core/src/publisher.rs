//! Draining decoded events into a broker partition
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bon::Builder;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::types::{Event, KeyStrategy, ValueFormat, WireMessage};

/// Write side of a connection to a single topic partition.
///
/// A writer is owned by exactly one [Publisher] and closed exactly once when the publisher
/// finishes, whether it finished successfully or not.
#[async_trait]
pub trait PartitionWriter: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Deliver one message. The caller bounds this with its write deadline.
    async fn write(&self, msg: &WireMessage) -> Result<(), Self::Error>;

    /// Flush and release the connection
    async fn close(self) -> Result<(), Self::Error>;
}

/// Bounded exponential backoff for retrying a single failed write
#[derive(Builder, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt, `0` disables retrying
    #[builder(default = 3)]
    pub max_retries: usize,
    #[builder(default = Duration::from_millis(100))]
    pub min_delay: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryConfig {
    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }
}

/// How events are turned into messages and how hard we try to deliver them
#[derive(Builder, Debug, Clone)]
pub struct PublisherConfig {
    /// Deadline for a single write attempt, measured from the start of the attempt
    #[builder(default = Duration::from_secs(10))]
    pub write_timeout: Duration,
    #[builder(default)]
    pub retry: RetryConfig,
    #[builder(default)]
    pub format: ValueFormat,
    #[builder(default)]
    pub key: KeyStrategy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Publishes every event received on a channel to one partition, in order.
pub struct Publisher<W> {
    writer: W,
    config: PublisherConfig,
}

impl<W> Publisher<W>
where
    W: PartitionWriter,
{
    pub fn new(writer: W, config: PublisherConfig) -> Self {
        Self { writer, config }
    }

    /// Publish until `events` is closed or `cancel` fires.
    ///
    /// A write which still fails after all retries ends the run with an error. The writer is
    /// closed before returning in every case.
    pub async fn run(
        self,
        events: flume::Receiver<Event>,
        cancel: CancellationToken,
    ) -> Result<PublishReport, PublishError<W::Error>> {
        let Self { writer, config } = self;
        let mut report = PublishReport::default();

        let outcome = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Publisher cancelled");
                    break Ok(());
                }
                event = events.recv_async() => match event {
                    Ok(event) => event,
                    // all senders are gone, the feed is finished
                    Err(_) => break Ok(()),
                },
            };
            let msg = match WireMessage::from_event(&event, config.format, config.key) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(
                        error = %e,
                        event_id = %event.meta.id,
                        "Failed to encode event, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
            };
            match write_with_retry(&writer, &msg, &config, &mut report).await {
                Ok(()) => {
                    report.published += 1;
                    info!("Sent message: {}", msg.value_lossy());
                }
                Err(e) => break Err(e),
            }
        };

        let closed = writer.close().await;
        match (outcome, closed) {
            (Ok(()), Ok(())) => Ok(report),
            (Ok(()), Err(e)) => Err(PublishError::Close(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                error!(
                    error = %close_err,
                    "Failed to close partition writer after publish failure"
                );
                Err(e)
            }
        }
    }
}

async fn write_with_retry<W: PartitionWriter>(
    writer: &W,
    msg: &WireMessage,
    config: &PublisherConfig,
    report: &mut PublishReport,
) -> Result<(), PublishError<W::Error>> {
    let timeout = config.write_timeout;
    let attempt = move || async move {
        match tokio::time::timeout(timeout, writer.write(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AttemptError::Write(e)),
            Err(_) => Err(AttemptError::Timeout(timeout)),
        }
    };
    let mut retries = 0;
    let result = attempt
        .retry(config.retry.backoff())
        .sleep(tokio::time::sleep)
        .notify(|e: &AttemptError<W::Error>, dur: Duration| {
            retries += 1;
            warn!("Failed to write message: {e}, retry in {dur:#?}");
        })
        .await;
    report.retries += retries;
    result.map_err(|e| PublishError::Write {
        attempts: retries + 1,
        source: e,
    })
}

/// Counters collected by a [Publisher] run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    /// Messages acknowledged by the writer
    pub published: u64,
    /// Write attempts that were repeated
    pub retries: u64,
    /// Events which could not be encoded
    pub skipped: u64,
}

/// A single write attempt failed
#[derive(Debug, Error)]
pub enum AttemptError<E> {
    #[error("Write did not complete within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Write(E),
}

/// Errors ending a [Publisher] run
#[derive(Debug, Error)]
pub enum PublishError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Failed to write message to partition after {attempts} attempts")]
    Write {
        attempts: u64,
        #[source]
        source: AttemptError<E>,
    },
    #[error("Failed to close partition writer")]
    Close(#[source] E),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeWriter, WriterScript};
    use crate::types::Change;

    fn event(id: i64) -> Event {
        Event {
            change: Change {
                id,
                kind: "edit".into(),
                title: format!("T{id}"),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn fast_retry(max_retries: usize) -> PublisherConfig {
        PublisherConfig::builder()
            .write_timeout(Duration::from_millis(50))
            .retry(
                RetryConfig::builder()
                    .max_retries(max_retries)
                    .min_delay(Duration::from_millis(1))
                    .max_delay(Duration::from_millis(2))
                    .build(),
            )
            .build()
    }

    #[tokio::test]
    async fn writes_every_event_in_order_and_closes_once() {
        let writer = FakeWriter::default();
        let (tx, rx) = flume::bounded(8);
        for id in 0..5 {
            tx.send(event(id)).unwrap();
        }
        drop(tx);

        let report = Publisher::new(writer.clone(), PublisherConfig::default())
            .run(rx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.published, 5);
        assert_eq!(report.retries, 0);
        let written: Vec<_> = writer
            .written()
            .iter()
            .map(|m| String::from_utf8(m.value.clone()).unwrap())
            .collect();
        let expected: Vec<_> = (0..5)
            .map(|id| format!("ID: {id}, Type: edit, Title: T{id}, User: , Comment: "))
            .collect();
        assert_eq!(written, expected);
        assert_eq!(writer.write_calls(), 5);
        assert_eq!(writer.close_calls(), 1);
    }

    #[tokio::test]
    async fn retries_failed_write() {
        let writer = FakeWriter::scripted([WriterScript::Fail, WriterScript::Fail]);
        let (tx, rx) = flume::bounded(1);
        tx.send(event(1)).unwrap();
        drop(tx);

        let report = Publisher::new(writer.clone(), fast_retry(3))
            .run(rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.retries, 2);
        assert_eq!(writer.write_calls(), 3);
        assert_eq!(writer.written().len(), 1);
    }

    #[tokio::test]
    async fn timed_out_write_is_retried() {
        let writer = FakeWriter::scripted([WriterScript::Hang]);
        let (tx, rx) = flume::bounded(1);
        tx.send(event(1)).unwrap();
        drop(tx);

        let report = Publisher::new(writer.clone(), fast_retry(1))
            .run(rx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.published, 1);
        assert_eq!(report.retries, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_and_close() {
        let writer = FakeWriter::scripted([WriterScript::Fail; 10]);
        let (tx, rx) = flume::bounded(2);
        tx.send(event(1)).unwrap();
        tx.send(event(2)).unwrap();

        let err = Publisher::new(writer.clone(), fast_retry(2))
            .run(rx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Write {
                attempts: 3,
                source: AttemptError::Write(_)
            }
        ));
        // the second event is never attempted
        assert_eq!(writer.write_calls(), 3);
        assert_eq!(writer.close_calls(), 1);
    }

    #[tokio::test]
    async fn close_failure_is_reported() {
        let writer = FakeWriter::default().failing_close();
        let (tx, rx) = flume::bounded::<Event>(1);
        drop(tx);
        let err = Publisher::new(writer.clone(), PublisherConfig::default())
            .run(rx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Close(_)));
        assert_eq!(writer.close_calls(), 1);
    }

    #[tokio::test]
    async fn cancel_stops_waiting_for_events() {
        let writer = FakeWriter::default();
        // keep the sender alive so only cancellation can end the run
        let (_tx, rx) = flume::bounded::<Event>(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Publisher::new(writer.clone(), PublisherConfig::default())
            .run(rx, cancel)
            .await
            .unwrap();
        assert_eq!(report.published, 0);
        assert_eq!(writer.close_calls(), 1);
    }

    #[tokio::test]
    async fn keyed_json_messages() {
        let writer = FakeWriter::default();
        let (tx, rx) = flume::bounded(1);
        let mut ev = event(9);
        ev.change.wiki = "enwiki".into();
        tx.send(ev.clone()).unwrap();
        drop(tx);
        let config = PublisherConfig::builder()
            .format(ValueFormat::Json)
            .key(KeyStrategy::Wiki)
            .build();
        Publisher::new(writer.clone(), config)
            .run(rx, CancellationToken::new())
            .await
            .unwrap();
        let written = writer.written();
        assert_eq!(written[0].key.as_deref(), Some(b"enwiki".as_slice()));
        let back: Event = serde_json::from_slice(&written[0].value).unwrap();
        assert_eq!(back, ev);
    }
}
