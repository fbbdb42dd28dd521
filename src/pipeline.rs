//! Pipeline Driver
//!
//! The single-threaded loop that ties the three stages together: pull the
//! next whole transaction from the extractor, route it to exactly one
//! action, project the payload, and apply it to the target inside one
//! database transaction together with the checkpoint row. State-store writes
//! buffered during the apply become durable only after the target commit
//! succeeds.
//!
//! Single-threadedness is the design, not a limitation: no component can
//! observe transactions out of commit order because there is exactly one
//! driver. Shard-level parallelism is an operational pattern (one process
//! per shard, each with its own checkpoint and state directory).
//!
//! ## Error Policy
//!
//! - Unclassified transactions halt the pipeline in strict mode (initial
//!   migration) and are dumped-and-skipped in permissive mode (catch-up).
//! - Transform faults and state lookup misses always halt: they mean the
//!   registry or the state seeding is wrong, and no later transaction can
//!   be trusted until an operator intervenes.
//! - Transient target faults (deadlock, lost connection, commit timeout)
//!   retry with exponential backoff; permanent faults halt.
//! - A checkpoint write failure is fatal.
//!
//! Cancellation is checked between transactions; a mid-flight target
//! transaction is rolled back by dropping it and the checkpoint stays put.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::actions::{self, ActionError, ActionPayload, RoutedAction};
use crate::config::{Config, PipelineMode};
use crate::events::Tx;
use crate::extract::{ExtractError, LogConsumer, LogExtractor};
use crate::load::{
    loader_for, postgres::write_checkpoint, Checkpoint, LoadError, TargetDb,
};
use crate::state::{StateError, StateScope, StateStore};
use crate::utils::{dump_poison_tx, RetryPolicy};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Extract stage failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Halted on xid {xid}: {source}")]
    Halted {
        xid: u64,
        #[source]
        source: ActionError,
    },

    #[error("Load stage failed on xid {xid}: {source}")]
    Load {
        xid: u64,
        #[source]
        source: LoadError,
    },

    #[error("State store error: {0}")]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Counters reported after a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub processed: u64,
    pub applied: u64,
    pub ignored: u64,
    pub skipped: u64,
}

/// The driver loop. Owns the extractor, the (optional) target connection,
/// and the state store; `target` is `None` in dry-run mode.
pub struct Driver<O: LogConsumer, T: LogConsumer> {
    extractor: LogExtractor<O, T>,
    target: Option<TargetDb>,
    state: StateStore,
    mode: PipelineMode,
    poison_dir: PathBuf,
    retry: RetryPolicy,
    commit_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<O: LogConsumer, T: LogConsumer> Driver<O, T> {
    pub fn new(
        extractor: LogExtractor<O, T>,
        target: Option<TargetDb>,
        state: StateStore,
        config: &Config,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            extractor,
            target,
            state,
            mode: config.pipeline.mode,
            poison_dir: PathBuf::from(&config.pipeline.poison_dir),
            retry: RetryPolicy {
                max_attempts: config.pipeline.max_retries,
                base_delay: Duration::from_millis(config.pipeline.retry_base_ms),
                ..RetryPolicy::default()
            },
            commit_timeout: Duration::from_secs(config.pipeline.commit_timeout_secs),
            shutdown,
        }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Drive the pipeline until the streams end, a halt condition fires, or
    /// cancellation is requested.
    pub async fn run(&mut self) -> Result<PipelineReport> {
        let mut report = PipelineReport::default();
        loop {
            if *self.shutdown.borrow() {
                info!("🛑 Cancellation requested, stopping between transactions");
                break;
            }
            let Some(tx) = self.extractor.next_tx().await? else {
                break;
            };
            report.processed += 1;

            let routed = match actions::route(&tx) {
                Ok(routed) => routed,
                Err(err @ ActionError::Unclassified { .. }) => {
                    self.dump(&tx, &err.to_string());
                    if self.mode == PipelineMode::Strict {
                        error!("Unclassified transaction xid={} in strict mode", tx.xid);
                        return Err(PipelineError::Halted {
                            xid: tx.xid,
                            source: err,
                        });
                    }
                    warn!("Skipping unclassified transaction xid={}", tx.xid);
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    // transform faults poison the pipeline in either mode
                    self.dump(&tx, &err.to_string());
                    return Err(PipelineError::Halted {
                        xid: tx.xid,
                        source: err,
                    });
                }
            };

            debug!("Routing xid={} to {}", tx.xid, routed.kind);
            let checkpoint = Checkpoint {
                last_commit_lsn: tx.commit_lsn,
                oldest_active_xid: self
                    .extractor
                    .oldest_pending_xid()
                    .unwrap_or(tx.xid)
                    .min(tx.xid),
            };

            match self.apply_with_retry(&tx, &routed, checkpoint).await {
                Ok(()) => {
                    if routed.kind.is_ignored() {
                        report.ignored += 1;
                    } else {
                        report.applied += 1;
                    }
                }
                Err(err) => {
                    if matches!(&err, LoadError::State(StateError::Missing { .. })) {
                        // a missing cross-Tx reference is a transform-class fault
                        self.dump(&tx, &err.to_string());
                    }
                    return Err(PipelineError::Load {
                        xid: tx.xid,
                        source: err,
                    });
                }
            }
        }

        info!(
            "✅ Pipeline run complete: {} processed, {} applied, {} ignored, {} skipped",
            report.processed, report.applied, report.ignored, report.skipped
        );
        Ok(report)
    }

    /// Apply one routed action, retrying transient target faults. Every
    /// attempt gets a fresh state scope so a failed attempt leaves nothing
    /// behind.
    async fn apply_with_retry(
        &mut self,
        tx: &Tx,
        routed: &RoutedAction,
        checkpoint: Checkpoint,
    ) -> std::result::Result<(), LoadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let scope = self.state.begin_scope();
            let result = apply_once(
                self.target.as_mut(),
                &routed.payload,
                routed.kind,
                checkpoint,
                scope,
                self.commit_timeout,
            )
            .await;
            match result {
                Ok(Some(scope_to_commit)) => {
                    self.state.commit_scope(scope_to_commit)?;
                    return Ok(());
                }
                Ok(None) => return Ok(()), // dry run: scope discarded
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Transient fault applying xid={} (attempt {attempt}): {err}; \
                         retrying in {delay:?}",
                        tx.xid
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn dump(&self, tx: &Tx, reason: &str) {
        match dump_poison_tx(&self.poison_dir, tx, reason) {
            Ok(path) => warn!("Dumped poison transaction to {}", path.display()),
            Err(e) => error!("Failed to dump poison transaction xid={}: {e}", tx.xid),
        }
    }

    /// Flush everything on shutdown
    pub async fn close(&self) {
        if let Err(e) = self.state.close().await {
            error!("Failed to close state store: {e}");
        }
    }
}

/// One apply attempt. Returns the scope for committing on success, or `None`
/// when running dry. Free function so the driver can hand out disjoint
/// borrows of its fields.
async fn apply_once<'a>(
    target: Option<&mut TargetDb>,
    payload: &ActionPayload,
    kind: actions::ActionKind,
    checkpoint: Checkpoint,
    mut scope: StateScope<'a>,
    commit_timeout: Duration,
) -> std::result::Result<Option<StateScope<'a>>, LoadError> {
    let loader = loader_for(kind);
    let Some(target) = target else {
        // dry run: render what would execute, commit nothing
        for statement in loader.prepare(payload, &mut scope)? {
            info!("🔎 [dry-run] {statement}");
        }
        return Ok(None);
    };

    let apply = async {
        let pg_tx = target.begin().await?;
        loader.run(payload, &pg_tx, &mut scope).await?;
        write_checkpoint(&pg_tx, &checkpoint).await?;
        pg_tx.commit().await.map_err(crate::load::classify_pg_error)
    };
    match tokio::time::timeout(commit_timeout, apply).await {
        Ok(Ok(())) => Ok(Some(scope)),
        Ok(Err(err)) => Err(err),
        // dropping the in-flight transaction rolls it back
        Err(_) => Err(LoadError::Transient(format!(
            "target transaction timed out after {commit_timeout:?}"
        ))),
    }
}
