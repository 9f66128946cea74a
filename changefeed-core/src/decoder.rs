//! Decoding of single feed lines into [Event]s
use thiserror::Error;

use crate::types::Event;

/// Lines carrying a payload start with this prefix
pub const DATA_PREFIX: &str = "data:";

/// Shortest line which can carry a payload: the prefix plus at least one byte
const MIN_CANDIDATE_LEN: usize = DATA_PREFIX.len() + 1;

/// Decode one line of the feed.
///
/// Returns `Ok(None)` for lines which are not data lines (SSE `event:`/`id:` fields,
/// comments, heartbeats, blank separators) and for a bare `data:` with nothing after it.
/// These are expected and must be skipped silently.
///
/// A data line whose payload is not a valid [Event] yields a [DecodeError].
/// Decoding the same bytes again will fail the same way, so callers should log and move on.
pub fn decode_line(line: &str) -> Result<Option<Event>, DecodeError> {
    if line.len() < MIN_CANDIDATE_LEN {
        return Ok(None);
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    serde_json::from_str(payload)
        .map(Some)
        .map_err(|source| DecodeError {
            line: line.to_owned(),
            source,
        })
}

/// A data line could not be decoded into an [Event]
#[derive(Debug, Error)]
#[error("Failed to decode feed line `{line}`")]
pub struct DecodeError {
    /// The offending line, prefix included
    pub line: String,
    #[source]
    pub source: serde_json::Error,
}
