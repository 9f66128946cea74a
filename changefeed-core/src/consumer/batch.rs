use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Byte bounds for a single batch fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Bytes the broker waits for before answering a fetch
    pub min_bytes: usize,
    /// Never return more than this many bytes, unless a single record is larger
    pub max_bytes: usize,
}

impl BatchLimits {
    /// Create limits, `min_bytes` must not exceed `max_bytes`
    pub fn new(min_bytes: usize, max_bytes: usize) -> Result<Self, InvalidBatchLimits> {
        if min_bytes > max_bytes {
            return Err(InvalidBatchLimits {
                min_bytes,
                max_bytes,
            });
        }
        Ok(Self {
            min_bytes,
            max_bytes,
        })
    }
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            min_bytes: 10,
            max_bytes: 1_000_000,
        }
    }
}

/// Read side of a connection to a single topic partition, outside of any consumer group.
#[async_trait]
pub trait PartitionReader: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the next batch, waiting at most `deadline`.
    ///
    /// Fetching itself does not fail. Errors hit while filling the batch are carried by the
    /// batch and reported when it is closed. A deadline without data yields an empty batch.
    async fn read_batch(
        &mut self,
        limits: BatchLimits,
        deadline: Duration,
    ) -> RecordBatch<Self::Error>;

    /// Release the connection
    async fn close(self) -> Result<(), Self::Error>;
}

/// Values of the records returned by one fetch, drained chunk by chunk.
#[derive(Debug)]
pub struct RecordBatch<E> {
    records: VecDeque<Vec<u8>>,
    /// read position inside the front record
    cursor: usize,
    error: Option<E>,
}

impl<E> RecordBatch<E> {
    /// Records with an empty value are dropped, they can not be told apart from the end of
    /// the batch by a reader.
    pub fn new(records: impl IntoIterator<Item = Vec<u8>>, error: Option<E>) -> Self {
        Self {
            records: records.into_iter().filter(|r| !r.is_empty()).collect(),
            cursor: 0,
            error,
        }
    }

    pub fn empty() -> Self {
        Self::new([], None)
    }

    /// Remaining records, a partially read record counts as one
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy the next chunk of the current record into `buf`.
    ///
    /// A chunk never spans two records, records larger than `buf` are returned over several
    /// calls. Returns `0` once the batch is exhausted.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some(record) = self.records.front() else {
            return 0;
        };
        let remaining = &record[self.cursor..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.cursor += n;
        if self.cursor >= record.len() {
            self.records.pop_front();
            self.cursor = 0;
        }
        n
    }

    /// Finish the batch, surfacing any error hit while it was fetched
    pub fn close(self) -> Result<(), E> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Settings of a [consume_batches] loop
#[derive(Builder, Debug, Clone, Copy)]
pub struct BatchConsumerConfig {
    #[builder(default)]
    pub limits: BatchLimits,
    /// Deadline applied to each batch fetch
    #[builder(default = Duration::from_secs(60))]
    pub read_timeout: Duration,
    /// Size of the buffer records are drained into
    #[builder(default = 10_000)]
    pub chunk_size: usize,
}

impl Default for BatchConsumerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Pull batches from `reader` until cancelled, handing every chunk to `on_chunk`.
///
/// There is no natural end, the loop only stops on cancellation or when a batch fails to
/// close. The reader is closed on both paths.
pub async fn consume_batches<R, F>(
    mut reader: R,
    config: BatchConsumerConfig,
    cancel: CancellationToken,
    mut on_chunk: F,
) -> Result<BatchReport, BatchConsumeError<R::Error>>
where
    R: PartitionReader,
    F: FnMut(&[u8]),
{
    let mut report = BatchReport::default();
    let mut buf = vec![0u8; config.chunk_size.max(1)];

    let outcome = loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            batch = reader.read_batch(config.limits, config.read_timeout) => batch,
        };
        if batch.is_empty() {
            debug!("No data before read deadline");
        }
        let mut batch = batch;
        loop {
            let n = batch.read(&mut buf);
            if n == 0 {
                break;
            }
            report.chunks += 1;
            report.bytes += n as u64;
            on_chunk(&buf[..n]);
        }
        if let Err(e) = batch.close() {
            break Err(BatchConsumeError::CloseBatch(e));
        }
        report.batches += 1;
    };

    let closed = reader.close().await;
    match (outcome, closed) {
        (Ok(()), Ok(())) => {
            info!(batches = report.batches, bytes = report.bytes, "Batch consumer stopped");
            Ok(report)
        }
        (Ok(()), Err(e)) => Err(BatchConsumeError::CloseConnection(e)),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            error!(error = %close_err, "Failed to close partition connection");
            Err(e)
        }
    }
}

/// Counters collected by [consume_batches]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    /// Batches fetched and closed cleanly
    pub batches: u64,
    pub chunks: u64,
    pub bytes: u64,
}

/// Fatal errors of [consume_batches]
#[derive(Debug, Error)]
pub enum BatchConsumeError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Failed to close batch")]
    CloseBatch(#[source] E),
    #[error("Failed to close partition connection")]
    CloseConnection(#[source] E),
}

/// `min_bytes` was larger than `max_bytes`
#[derive(Debug, Error)]
#[error("Minimum batch size {min_bytes} exceeds maximum batch size {max_bytes}")]
pub struct InvalidBatchLimits {
    pub min_bytes: usize,
    pub max_bytes: usize,
}
