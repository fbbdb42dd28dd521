//! Log Extraction: Two-Stream Transaction Reassembly
//!
//! The extractor merges the row-operation topic and the transaction-boundary
//! topic into a single ordered sequence of whole transactions. The log is
//! at-least-once and partition-ordered at best, so records arrive out of
//! order, duplicated, and interleaved arbitrarily between the two streams;
//! the extractor's job is to absorb all of that and still emit every
//! committed transaction exactly once, in strictly increasing commit order.
//!
//! ## Buffering Model
//!
//! Three structures carry the in-flight state:
//! - `pending_ops`: operations whose transaction boundary has not arrived yet
//! - `pending_tx`: boundaries whose operation count is not yet satisfied
//! - `ready`: completed transactions ordered by commit LSN, held back by the
//!   slack window
//!
//! A transaction is promoted to `ready` the moment its operation count
//! matches its boundary's `event_count`, regardless of which stream ran
//! ahead. The head of `ready` is emitted once at least `tx_buffer_slack`
//! later boundaries have been observed (or unconditionally once both streams
//! end); this is what protects commit order against late arrivals.
//!
//! ## Resume Semantics
//!
//! `last_commit_lsn` is the checkpoint: boundaries at or below it are dropped
//! together with their operations, so duplicate replays after a restart are
//! absorbed silently. `oldest_active_xid` suppresses operations from
//! transactions that had already committed before the resume point, even if
//! their rows reappear in the replayed window.
//!
//! Operations left unmatched when both streams end belong to uncommitted or
//! rolled-back source transactions; they are discarded with a diagnostic.

pub mod consumer;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::events::{EventError, LogRecord, Operation, Tx, TxInfo};
use crate::schema;
use crate::utils::RetryPolicy;

pub use consumer::{JsonlConsumer, LogConsumer, MemoryConsumer};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Consumer fault: {0}")]
    Consumer(String),

    #[error("Consumer fault persisted after {attempts} attempts: {last}")]
    ConsumerExhausted { attempts: u32, last: String },

    #[error("Event error: {0}")]
    Event(#[from] EventError),
}

pub type Result<T> = std::result::Result<T, ExtractError>;

/// Default number of newer boundaries that must be observed before the
/// buffered head is considered safe to emit
pub const DEFAULT_TX_BUFFER_SLACK: usize = 10;

/// Counters reported at end-of-stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub emitted: u64,
    pub malformed: u64,
    pub suppressed_ops: u64,
    pub discarded_incomplete: u64,
}

pub struct LogExtractor<O: LogConsumer, T: LogConsumer> {
    ops_consumer: O,
    tx_consumer: T,
    last_commit_lsn: u64,
    oldest_active_xid: u64,
    slack: usize,
    retry: RetryPolicy,
    pull_timeout: std::time::Duration,

    pending_ops: HashMap<u64, Vec<Operation>>,
    pending_tx: HashMap<u64, TxInfo>,
    ready: BTreeMap<u64, Tx>,
    out: VecDeque<Tx>,
    /// xids whose boundary fell at or below the checkpoint
    suppressed: HashSet<u64>,
    ops_done: bool,
    tx_done: bool,
    drained: bool,
    last_emitted: Option<u64>,
    stats: ExtractStats,
}

impl<O: LogConsumer, T: LogConsumer> LogExtractor<O, T> {
    pub fn new(
        ops_consumer: O,
        tx_consumer: T,
        last_commit_lsn: u64,
        oldest_active_xid: u64,
    ) -> Self {
        Self {
            ops_consumer,
            tx_consumer,
            last_commit_lsn,
            oldest_active_xid,
            slack: DEFAULT_TX_BUFFER_SLACK,
            retry: RetryPolicy::default(),
            pull_timeout: std::time::Duration::from_secs(30),
            pending_ops: HashMap::new(),
            pending_tx: HashMap::new(),
            ready: BTreeMap::new(),
            out: VecDeque::new(),
            suppressed: HashSet::new(),
            ops_done: false,
            tx_done: false,
            drained: false,
            last_emitted: None,
            stats: ExtractStats::default(),
        }
    }

    pub fn with_slack(mut self, slack: usize) -> Self {
        self.slack = slack;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pull_timeout(mut self, pull_timeout: std::time::Duration) -> Self {
        self.pull_timeout = pull_timeout;
        self
    }

    pub fn stats(&self) -> ExtractStats {
        self.stats
    }

    /// The smallest xid still waiting on a boundary or on operations; feeds
    /// the checkpoint's `oldest_active_xid`
    pub fn oldest_pending_xid(&self) -> Option<u64> {
        let pending_op = self.pending_ops.keys().min().copied();
        let pending_tx = self.pending_tx.keys().min().copied();
        match (pending_op, pending_tx) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Pull the next whole transaction, or `None` once both streams have
    /// ended and every buffered transaction has been emitted.
    pub async fn next_tx(&mut self) -> Result<Option<Tx>> {
        loop {
            if let Some(tx) = self.out.pop_front() {
                self.stats.emitted += 1;
                self.commit_offsets().await;
                return Ok(Some(tx));
            }
            if self.ops_done && self.tx_done {
                if !self.drained {
                    self.finish();
                    continue;
                }
                return Ok(None);
            }
            self.step().await?;
        }
    }

    /// One driver step: pull a batch from each live stream, ingest, and
    /// drain whatever became safe to emit.
    async fn step(&mut self) -> Result<()> {
        if !self.ops_done {
            match poll_with_retry(&mut self.ops_consumer, &self.retry, self.pull_timeout, "ops")
                .await?
            {
                Some(batch) => {
                    trace!("Ops batch: {} record(s)", batch.len());
                    for record in batch {
                        self.ingest_op(record);
                    }
                }
                None => {
                    debug!("📭 Ops stream ended");
                    self.ops_done = true;
                }
            }
        }
        if !self.tx_done {
            match poll_with_retry(&mut self.tx_consumer, &self.retry, self.pull_timeout, "tx")
                .await?
            {
                Some(batch) => {
                    trace!("Boundary batch: {} record(s)", batch.len());
                    for record in batch {
                        self.ingest_boundary(record);
                    }
                }
                None => {
                    debug!("📭 Boundary stream ended");
                    self.tx_done = true;
                }
            }
        }
        self.drain_safe();
        Ok(())
    }

    fn ingest_op(&mut self, record: LogRecord) {
        let mut operation = match record.into_operation() {
            Ok(operation) => operation,
            Err(e) => {
                warn!("Skipping malformed operation record: {e}");
                self.stats.malformed += 1;
                return;
            }
        };
        for image in [operation.before.as_mut(), operation.after.as_mut()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = schema::validate_row(&operation.source_table, image) {
                warn!("Skipping operation with invalid row image: {e}");
                self.stats.malformed += 1;
                return;
            }
        }
        if operation.xid < self.oldest_active_xid {
            trace!(
                "Dropping op for pre-resume xid {} ({})",
                operation.xid,
                operation.source_table
            );
            self.stats.suppressed_ops += 1;
            return;
        }
        if self.suppressed.contains(&operation.xid) {
            self.stats.suppressed_ops += 1;
            return;
        }
        let xid = operation.xid;
        let ops = self.pending_ops.entry(xid).or_default();
        if ops.iter().any(|existing| existing.lsn == operation.lsn) {
            // at-least-once delivery: same op replayed
            return;
        }
        ops.push(operation);
        self.try_promote(xid);
    }

    fn ingest_boundary(&mut self, record: LogRecord) {
        let info = match record.into_tx_info() {
            Ok(Some(info)) => info,
            Ok(None) => return,
            Err(e) => {
                warn!("Skipping malformed boundary record: {e}");
                self.stats.malformed += 1;
                return;
            }
        };
        if info.commit_lsn <= self.last_commit_lsn {
            trace!(
                "Dropping boundary for xid {} at or below checkpoint",
                info.xid
            );
            self.suppressed.insert(info.xid);
            if let Some(discarded) = self.pending_ops.remove(&info.xid) {
                self.stats.suppressed_ops += discarded.len() as u64;
            }
            return;
        }
        if self
            .last_emitted
            .map(|lsn| info.commit_lsn <= lsn)
            .unwrap_or(false)
        {
            // boundary replay for an already-emitted transaction
            return;
        }
        if self.pending_tx.contains_key(&info.xid) || self.ready.contains_key(&info.commit_lsn) {
            return;
        }
        self.pending_tx.insert(info.xid, info);
        self.try_promote(info.xid);
    }

    /// Promote a transaction whose boundary and full operation set are both
    /// present: sort by per-op LSN, back-fill the commit LSN, move to ready.
    fn try_promote(&mut self, xid: u64) {
        let Some(info) = self.pending_tx.get(&xid).copied() else {
            return;
        };
        let complete = self
            .pending_ops
            .get(&xid)
            .map(|ops| ops.len() >= info.event_count)
            .unwrap_or(info.event_count == 0);
        if !complete {
            return;
        }
        self.pending_tx.remove(&xid);
        let mut operations = self.pending_ops.remove(&xid).unwrap_or_default();
        if operations.len() > info.event_count {
            warn!(
                "xid {} carries {} ops but boundary promised {}; keeping all",
                xid,
                operations.len(),
                info.event_count
            );
        }
        operations.sort_by_key(|op| op.lsn);
        for op in &mut operations {
            op.commit_lsn = Some(info.commit_lsn);
        }
        self.ready.insert(
            info.commit_lsn,
            Tx {
                xid,
                commit_lsn: info.commit_lsn,
                operations,
            },
        );
    }

    /// Number of observed, not-yet-emitted boundaries newer than `head`
    fn newer_than(&self, head: u64) -> usize {
        let pending = self
            .pending_tx
            .values()
            .filter(|info| info.commit_lsn > head)
            .count();
        let ready = self
            .ready
            .range((std::ops::Bound::Excluded(head), std::ops::Bound::Unbounded))
            .count();
        pending + ready
    }

    /// Emit every head that is safely behind the slack window
    fn drain_safe(&mut self) {
        while let Some(head) = self.ready.keys().next().copied() {
            if self.newer_than(head) < self.slack {
                break;
            }
            let tx = self.ready.remove(&head).expect("head exists");
            self.emit(tx);
        }
    }

    fn emit(&mut self, tx: Tx) {
        debug_assert!(self.last_emitted.map(|lsn| tx.commit_lsn > lsn).unwrap_or(true));
        self.last_emitted = Some(tx.commit_lsn);
        self.out.push_back(tx);
    }

    /// Both streams ended: flush the ready buffer unconditionally and report
    /// whatever never completed.
    fn finish(&mut self) {
        let ready = std::mem::take(&mut self.ready);
        for (_, tx) in ready {
            self.emit(tx);
        }
        if !self.pending_ops.is_empty() {
            let ops: usize = self.pending_ops.values().map(Vec::len).sum();
            self.stats.discarded_incomplete += ops as u64;
            warn!(
                "Discarding {} unmatched op(s) across {} transaction(s) at end of stream \
                 (uncommitted or rolled back on the source)",
                ops,
                self.pending_ops.len()
            );
            self.pending_ops.clear();
        }
        if !self.pending_tx.is_empty() {
            warn!(
                "Discarding {} boundary record(s) whose operations never arrived",
                self.pending_tx.len()
            );
            self.pending_tx.clear();
        }
        info!(
            "📦 Extract complete: {} tx emitted, {} malformed record(s) skipped",
            self.stats.emitted + self.out.len() as u64,
            self.stats.malformed
        );
        self.drained = true;
    }

    async fn commit_offsets(&mut self) {
        if let Err(e) = self.ops_consumer.commit().await {
            debug!("Advisory ops offset commit failed: {e}");
        }
        if let Err(e) = self.tx_consumer.commit().await {
            debug!("Advisory tx offset commit failed: {e}");
        }
    }
}

/// Retry a consumer pull with exponential backoff; a pull that exceeds the
/// timeout counts as a transient fault. Pending state is only touched once a
/// batch actually arrives.
async fn poll_with_retry<C: LogConsumer>(
    consumer: &mut C,
    retry: &RetryPolicy,
    pull_timeout: std::time::Duration,
    stream: &str,
) -> Result<Option<Vec<LogRecord>>> {
    let mut attempt = 0;
    loop {
        let pull = tokio::time::timeout(pull_timeout, consumer.poll())
            .await
            .unwrap_or_else(|_| {
                Err(ExtractError::Consumer(format!(
                    "pull timed out after {pull_timeout:?}"
                )))
            });
        match pull {
            Ok(batch) => return Ok(batch),
            Err(ExtractError::Consumer(reason)) => {
                attempt += 1;
                if attempt >= retry.max_attempts {
                    return Err(ExtractError::ConsumerExhausted {
                        attempts: attempt,
                        last: reason,
                    });
                }
                let delay = retry.delay_for(attempt);
                warn!(
                    "{stream} consumer fault (attempt {attempt}): {reason}; retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(other) => return Err(other),
        }
    }
}
