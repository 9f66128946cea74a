//! Scripted stand-ins for the broker transport traits
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::consumer::{BatchLimits, GroupReader, PartitionReader, RecordBatch};
use crate::publisher::PartitionWriter;
use crate::types::{Record, WireMessage};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("fake transport failure")]
pub(crate) struct FakeError;

/// Counts how often a fake was closed, survives the fake being consumed by `close`
#[derive(Debug, Clone, Default)]
pub(crate) struct CloseProbe(Arc<AtomicUsize>);

impl CloseProbe {
    pub(crate) fn close_calls(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn closed(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Behaviour of the next write of a [FakeWriter]
#[derive(Debug, Clone, Copy)]
pub(crate) enum WriterScript {
    Ok,
    Fail,
    /// never completes
    Hang,
}

#[derive(Debug, Default)]
struct WriterState {
    script: VecDeque<WriterScript>,
    written: Vec<WireMessage>,
    write_calls: usize,
}

/// Records every written message. Writes succeed unless scripted otherwise.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeWriter {
    state: Arc<Mutex<WriterState>>,
    probe: CloseProbe,
    fail_close: bool,
}

impl FakeWriter {
    pub(crate) fn scripted(script: impl IntoIterator<Item = WriterScript>) -> Self {
        let writer = Self::default();
        writer.state.lock().unwrap().script = script.into_iter().collect();
        writer
    }

    pub(crate) fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub(crate) fn written(&self) -> Vec<WireMessage> {
        self.state.lock().unwrap().written.clone()
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.state.lock().unwrap().write_calls
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.probe.close_calls()
    }
}

#[async_trait]
impl PartitionWriter for FakeWriter {
    type Error = FakeError;

    async fn write(&self, msg: &WireMessage) -> Result<(), FakeError> {
        let step = {
            let mut state = self.state.lock().unwrap();
            state.write_calls += 1;
            state.script.pop_front().unwrap_or(WriterScript::Ok)
        };
        match step {
            WriterScript::Ok => {
                self.state.lock().unwrap().written.push(msg.clone());
                Ok(())
            }
            WriterScript::Fail => Err(FakeError),
            WriterScript::Hang => std::future::pending().await,
        }
    }

    async fn close(self) -> Result<(), FakeError> {
        self.probe.closed();
        if self.fail_close {
            Err(FakeError)
        } else {
            Ok(())
        }
    }
}

/// Hands out scripted batches, then cancels the given token and waits forever
pub(crate) struct ScriptedPartitionReader {
    batches: VecDeque<RecordBatch<FakeError>>,
    when_done: CancellationToken,
    probe: CloseProbe,
}

impl ScriptedPartitionReader {
    pub(crate) fn new(batches: Vec<RecordBatch<FakeError>>, when_done: CancellationToken) -> Self {
        Self {
            batches: batches.into(),
            when_done,
            probe: CloseProbe::default(),
        }
    }

    pub(crate) fn probe(&self) -> CloseProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl PartitionReader for ScriptedPartitionReader {
    type Error = FakeError;

    async fn read_batch(
        &mut self,
        _limits: BatchLimits,
        _deadline: Duration,
    ) -> RecordBatch<FakeError> {
        match self.batches.pop_front() {
            Some(batch) => batch,
            None => {
                self.when_done.cancel();
                std::future::pending().await
            }
        }
    }

    async fn close(self) -> Result<(), FakeError> {
        self.probe.closed();
        Ok(())
    }
}

/// Yields scripted records, then fails every read like a closed reader would
pub(crate) struct ScriptedGroupReader {
    records: VecDeque<Record>,
    block_when_empty: bool,
    fail_close: bool,
    probe: CloseProbe,
}

impl ScriptedGroupReader {
    pub(crate) fn new(records: Vec<Record>) -> Self {
        Self {
            records: records.into(),
            block_when_empty: false,
            fail_close: false,
            probe: CloseProbe::default(),
        }
    }

    /// Wait forever instead of failing once all records were read
    pub(crate) fn blocking_when_empty(mut self) -> Self {
        self.block_when_empty = true;
        self
    }

    pub(crate) fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub(crate) fn probe(&self) -> CloseProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl GroupReader for ScriptedGroupReader {
    type Error = FakeError;

    async fn read(&mut self) -> Result<Record, FakeError> {
        match self.records.pop_front() {
            Some(record) => Ok(record),
            None if self.block_when_empty => std::future::pending().await,
            None => Err(FakeError),
        }
    }

    async fn close(self) -> Result<(), FakeError> {
        self.probe.closed();
        if self.fail_close {
            Err(FakeError)
        } else {
            Ok(())
        }
    }
}
