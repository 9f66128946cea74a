//! Reading the upstream server-sent-events feed
use std::time::Duration;

use bon::Builder;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, HeaderValue};
use thiserror::Error;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::decoder::decode_line;
use crate::types::Event;

/// Default upstream feed
pub const DEFAULT_FEED_URL: &str = "https://stream.wikimedia.org/v2/stream/recentchange";

/// Where and how to connect to the feed
#[derive(Builder, Debug, Clone)]
#[builder(on(String, into))]
pub struct FeedConfig {
    pub url: Url,
    /// Sent with the request, public feeds commonly reject anonymous clients
    #[builder(default = concat!("changefeed/", env!("CARGO_PKG_VERSION")).to_owned())]
    pub user_agent: String,
    /// Timeout for establishing the connection. The stream itself has no deadline.
    #[builder(default = Duration::from_secs(10))]
    pub connect_timeout: Duration,
}

/// An open connection to the feed.
///
/// Owns the HTTP response. The body is released when the reader is dropped or
/// [FeedReader::pump] returns.
#[derive(Debug)]
pub struct FeedReader {
    response: reqwest::Response,
}

impl FeedReader {
    /// Open the feed. Any connection failure or non-success status is returned as an error,
    /// there is no reconnect.
    pub async fn connect(config: &FeedConfig) -> Result<Self, FeedError> {
        info!(url = %config.url, "Starting to read from feed");
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(FeedError::Client)?;
        let response = client
            .get(config.url.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .send()
            .await
            .map_err(FeedError::Connect)?;
        info!(status = %response.status(), "Feed response status");
        let response = response.error_for_status().map_err(FeedError::Status)?;
        Ok(Self { response })
    }

    /// Forward every decodable event of the feed into `events` until the feed ends,
    /// fails, is cancelled or the receiving side goes away.
    ///
    /// Dropping `events` on return closes the channel for the consumer.
    pub async fn pump(
        self,
        events: flume::Sender<Event>,
        cancel: CancellationToken,
    ) -> ReadReport {
        pump_lines(self.response.bytes_stream(), events, cancel).await
    }
}

/// Drive any chunked byte stream through the line decoder into `events`.
///
/// Lines end with `\n`, a trailing `\r` is dropped and invalid UTF-8 is replaced. A final
/// line without terminator is still decoded when the stream ends.
///
/// Sending applies backpressure: if the channel is full this waits for the consumer
/// instead of buffering. Malformed lines are logged and skipped, read errors end the
/// stream and are logged.
pub async fn pump_lines<S, E>(
    body: S,
    events: flume::Sender<Event>,
    cancel: CancellationToken,
) -> ReadReport
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let reader = StreamReader::new(body.map_err(|e| std::io::Error::other(e.to_string())));
    let mut lines = std::pin::pin!(FramedRead::new(
        reader,
        AnyDelimiterCodec::new(b"\n".to_vec(), Vec::new())
    ));
    let mut report = ReadReport::default();

    let end = loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StreamEnd::Cancelled,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!(error = %e, "Error reading stream");
                break StreamEnd::ReadError;
            }
            None => break StreamEnd::Eof,
        };
        let line = line.strip_suffix(b"\r").unwrap_or(&line[..]);
        let text = String::from_utf8_lossy(line);
        if let Err(end) = forward_line(&text, &events, &cancel, &mut report).await {
            break end;
        }
    };
    report.end = end;
    info!(
        lines = report.lines,
        forwarded = report.forwarded,
        malformed = report.malformed,
        end = ?report.end,
        "Feed reader finished"
    );
    report
}

async fn forward_line(
    line: &str,
    events: &flume::Sender<Event>,
    cancel: &CancellationToken,
    report: &mut ReadReport,
) -> Result<(), StreamEnd> {
    report.lines += 1;
    let event = match decode_line(line) {
        Ok(Some(event)) => event,
        Ok(None) => {
            report.ignored += 1;
            return Ok(());
        }
        Err(e) => {
            report.malformed += 1;
            warn!(line = %e.line, error = %e.source, "Failed to decode feed line");
            return Ok(());
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StreamEnd::Cancelled),
        sent = events.send_async(event) => match sent {
            Ok(()) => {
                report.forwarded += 1;
                Ok(())
            }
            Err(_) => {
                debug!("Event receiver dropped, stopping feed reader");
                Err(StreamEnd::ReceiverGone)
            }
        },
    }
}

/// Counters collected while reading the feed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadReport {
    /// Lines seen, including ignored and malformed ones
    pub lines: u64,
    /// Non-data lines
    pub ignored: u64,
    /// Data lines which failed to decode
    pub malformed: u64,
    /// Events handed to the channel
    pub forwarded: u64,
    pub end: StreamEnd,
}

/// Why the feed reader stopped
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The remote closed the stream
    #[default]
    Eof,
    /// Reading from the transport failed
    ReadError,
    /// The cancellation token fired
    Cancelled,
    /// Nobody is receiving events anymore
    ReceiverGone,
}

/// Errors establishing the feed connection
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Failed to build HTTP client")]
    Client(#[source] reqwest::Error),
    #[error("Failed to connect to feed")]
    Connect(#[source] reqwest::Error),
    #[error("Feed responded with an error status")]
    Status(#[source] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn body(chunks: &[&'static str]) -> impl Stream<Item = Result<Bytes, Infallible>> {
        futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        )
    }

    #[tokio::test]
    async fn skips_malformed_and_control_lines() {
        let (tx, rx) = flume::unbounded();
        let report = pump_lines(
            body(&[
                ":ok\nevent: message\n",
                "data: {\"id\": 1,\n",
                "data: {\"id\": 2, \"title\": \"A\"}\n\n",
                "data:\n",
                "data: {\"id\": 3}",
            ]),
            tx,
            CancellationToken::new(),
        )
        .await;

        let ids: Vec<_> = rx.drain().map(|e| e.change.id).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.forwarded, 2);
        assert_eq!(report.ignored, 4);
        assert_eq!(report.lines, 7);
        assert_eq!(report.end, StreamEnd::Eof);
    }

    #[tokio::test]
    async fn channel_closes_after_eof() {
        let (tx, rx) = flume::bounded(4);
        pump_lines(body(&["data: {\"id\": 1}\n"]), tx, CancellationToken::new()).await;
        assert_eq!(rx.recv_async().await.unwrap().change.id, 1);
        assert!(rx.recv_async().await.is_err());
    }

    #[tokio::test]
    async fn read_error_ends_stream() {
        let chunks: Vec<Result<Bytes, &str>> = vec![
            Ok(Bytes::from_static(b"data: {\"id\": 1}\n")),
            Err("connection reset"),
            Ok(Bytes::from_static(b"data: {\"id\": 2}\n")),
        ];
        let (tx, rx) = flume::unbounded();
        let report = pump_lines(futures::stream::iter(chunks), tx, CancellationToken::new()).await;
        assert_eq!(report.end, StreamEnd::ReadError);
        assert_eq!(rx.drain().count(), 1);
    }

    #[tokio::test]
    async fn blocks_on_full_channel() {
        let (tx, rx) = flume::bounded(1);
        let task = tokio::spawn(pump_lines(
            body(&["data: {\"id\": 1}\ndata: {\"id\": 2}\ndata: {\"id\": 3}\n"]),
            tx,
            CancellationToken::new(),
        ));
        // the reader can not make progress past the channel capacity
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert_eq!(rx.len(), 1);

        let ids: Vec<_> = rx.into_stream().map(|e| e.change.id).collect().await;
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(task.await.unwrap().forwarded, 3);
    }

    #[tokio::test]
    async fn cancel_while_blocked_on_send() {
        let (tx, rx) = flume::bounded(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(pump_lines(
            body(&["data: {\"id\": 1}\ndata: {\"id\": 2}\n"]),
            tx,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let report = task.await.unwrap();
        assert_eq!(report.end, StreamEnd::Cancelled);
        assert_eq!(report.forwarded, 1);
        assert_eq!(rx.drain().count(), 1);
    }

    #[tokio::test]
    async fn stops_when_receiver_dropped() {
        let (tx, rx) = flume::bounded(1);
        drop(rx);
        let report = pump_lines(body(&["data: {\"id\": 1}\n"]), tx, CancellationToken::new()).await;
        assert_eq!(report.end, StreamEnd::ReceiverGone);
        assert_eq!(report.forwarded, 0);
    }

    #[tokio::test]
    async fn crlf_and_split_lines() {
        let (tx, rx) = flume::unbounded();
        let report = pump_lines(
            body(&["data: {\"id\": 1, \"tit", "le\": \"A\"}\r\n", "data: {\"id\": 2}\r\n"]),
            tx,
            CancellationToken::new(),
        )
        .await;
        let titles: Vec<_> = rx.drain().map(|e| (e.change.id, e.change.title)).collect();
        assert_eq!(titles, vec![(1, "A".to_owned()), (2, String::new())]);
        assert_eq!(report.malformed, 0);
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let chunks: Vec<Result<Bytes, Infallible>> = vec![Ok(Bytes::from_static(
            b"data: {\"id\": 1, \"title\": \"a\xffb\"}\n",
        ))];
        let (tx, rx) = flume::unbounded();
        pump_lines(futures::stream::iter(chunks), tx, CancellationToken::new()).await;
        assert_eq!(rx.recv_async().await.unwrap().change.title, "a\u{FFFD}b");
    }

    #[tokio::test]
    async fn long_line_in_small_chunks() {
        // 4 MiB title delivered in 8 KiB pieces
        let title = "x".repeat(4 << 20);
        let line = format!("data: {{\"id\": 7, \"title\": \"{title}\"}}\n");
        let chunks: Vec<Result<Bytes, Infallible>> = line
            .as_bytes()
            .chunks(8 << 10)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let (tx, rx) = flume::unbounded();
        let report = tokio::time::timeout(
            Duration::from_secs(10),
            pump_lines(futures::stream::iter(chunks), tx, CancellationToken::new()),
        )
        .await
        .expect("splitting one long line must stay linear");
        assert_eq!(report.forwarded, 1);
        assert_eq!(rx.recv_async().await.unwrap().change.title.len(), 4 << 20);
    }

    #[test]
    fn config_defaults() {
        let config = FeedConfig::builder()
            .url(Url::parse(DEFAULT_FEED_URL).unwrap())
            .build();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.user_agent.starts_with("changefeed/"));
    }
}
