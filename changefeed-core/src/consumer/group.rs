use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::types::Record;

/// Membership in a consumer group. Partition assignment and offsets are tracked by the broker.
#[async_trait]
pub trait GroupReader: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Wait for the next record of any partition assigned to this member
    async fn read(&mut self) -> Result<Record, Self::Error>;

    /// Leave the group
    async fn close(self) -> Result<(), Self::Error>;
}

/// When consumed offsets are committed to the group coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// The broker client commits periodically in the background
    Auto {
        /// Time between background commits
        interval: Duration,
    },
    /// Each record's offset is committed right after it was read, remaining offsets are
    /// committed synchronously when the session closes
    AfterRead,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self::Auto {
            interval: Duration::from_secs(5),
        }
    }
}

/// Read records as a group member until a read fails or `cancel` fires.
///
/// A read error ends the loop but is not an error of the loop itself, it is returned in
/// the report. Failing to leave the group afterwards is.
pub async fn consume_group<R, F>(
    mut reader: R,
    cancel: CancellationToken,
    mut on_record: F,
) -> Result<GroupReport<R::Error>, GroupConsumeError<R::Error>>
where
    R: GroupReader,
    F: FnMut(&Record),
{
    let mut consumed = 0;
    let stopped_by = loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Cancelled,
            read = reader.read() => read,
        };
        match read {
            Ok(record) => {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "Received message: {}",
                    String::from_utf8_lossy(&record.payload)
                );
                on_record(&record);
                consumed += 1;
            }
            Err(e) => {
                warn!(error = %e, "Stopping group consumer after read error");
                break StopReason::ReadError(e);
            }
        }
    };
    reader.close().await.map_err(GroupConsumeError::Close)?;
    Ok(GroupReport {
        consumed,
        stopped_by,
    })
}

/// Outcome of [consume_group]
#[derive(Debug)]
pub struct GroupReport<E> {
    /// Records handed to the callback
    pub consumed: u64,
    pub stopped_by: StopReason<E>,
}

/// Why a consumer loop ended
#[derive(Debug)]
pub enum StopReason<E> {
    Cancelled,
    ReadError(E),
}

/// Fatal errors of [consume_group]
#[derive(Debug, Error)]
pub enum GroupConsumeError<E>
where
    E: std::error::Error + 'static,
{
    #[error("Failed to close group session")]
    Close(#[source] E),
}
