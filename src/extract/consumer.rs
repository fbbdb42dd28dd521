//! Log Consumers
//!
//! Pull-based sources for the two logical topics the extractor merges. A
//! consumer yields batches of raw [`LogRecord`]s until its stream ends; batch
//! sizes are arbitrary and batches may be empty. Offset commits are advisory:
//! correctness comes from the checkpoint, not from committed offsets.
//!
//! Two implementations ship with the pipeline:
//! - [`JsonlConsumer`] reads a newline-delimited JSON dump of a topic, the
//!   format produced by the capture tooling and used by the fixture corpus.
//! - [`MemoryConsumer`] serves pre-built batches, for tests and dry runs.
//!
//! A broker-backed consumer plugs in behind the same trait.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::{ExtractError, Result};
use crate::events::LogRecord;

/// A pull-based source of topic records. `poll` returns `None` once the
/// stream has ended; every earlier call returns a (possibly empty) batch.
#[async_trait]
pub trait LogConsumer: Send {
    async fn poll(&mut self) -> Result<Option<Vec<LogRecord>>>;

    /// Advisory offset commit, invoked after a transaction is emitted
    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reads a topic dump in newline-delimited JSON, yielding fixed-size batches
pub struct JsonlConsumer {
    reader: BufReader<File>,
    batch_size: usize,
    exhausted: bool,
    line_no: u64,
}

impl JsonlConsumer {
    pub const DEFAULT_BATCH_SIZE: usize = 256;

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            ExtractError::Consumer(format!(
                "cannot open topic dump {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self {
            reader: BufReader::new(file),
            batch_size: Self::DEFAULT_BATCH_SIZE,
            exhausted: false,
            line_no: 0,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl LogConsumer for JsonlConsumer {
    async fn poll(&mut self) -> Result<Option<Vec<LogRecord>>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut batch = Vec::with_capacity(self.batch_size);
        while batch.len() < self.batch_size {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| ExtractError::Consumer(format!("topic dump read failed: {e}")))?;
            if read == 0 {
                self.exhausted = true;
                break;
            }
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match LogRecord::from_line(trimmed) {
                Ok(record) => batch.push(record),
                Err(e) => {
                    // Malformed lines never stall the stream
                    tracing::warn!("Skipping malformed record at line {}: {e}", self.line_no);
                }
            }
        }
        if batch.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

/// Serves pre-built batches from memory, then signals end-of-stream
pub struct MemoryConsumer {
    batches: VecDeque<Vec<LogRecord>>,
}

impl MemoryConsumer {
    pub fn new(batches: Vec<Vec<LogRecord>>) -> Self {
        Self {
            batches: batches.into(),
        }
    }

    /// A single batch containing every record
    pub fn single(records: Vec<LogRecord>) -> Self {
        Self::new(vec![records])
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn poll(&mut self) -> Result<Option<Vec<LogRecord>>> {
        Ok(self.batches.pop_front())
    }
}
