//! Cross-cutting utilities: retry policies and poison-transaction dumps
//!
//! Small helpers shared by the extract and load stages. Retries use plain
//! exponential backoff with a cap; there is deliberately no jitter, because
//! the pipeline is single-threaded and never competes with itself.

use chrono::Utc;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::events::Tx;

/// Exponential backoff policy for transient faults (consumer pulls, target
/// commits). Attempt numbering starts at 1.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Serialize a transaction that could not be transformed or loaded so an
/// operator can inspect it and decide: fix the data, add an action, or mark
/// it ignored. Returns the dump path.
pub fn dump_poison_tx(dir: &Path, tx: &Tx, reason: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let dumped_at = Utc::now();
    let path = dir.join(format!(
        "poison_tx_{}_{}.json",
        tx.xid,
        dumped_at.format("%Y%m%dT%H%M%S%3f")
    ));
    let document = json!({
        "reason": reason,
        "dumped_at": dumped_at.to_rfc3339(),
        "xid": tx.xid,
        "commit_lsn": tx.commit_lsn,
        "tx": tx,
    });
    fs::write(&path, serde_json::to_vec_pretty(&document)?)?;
    Ok(path)
}
