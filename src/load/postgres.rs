//! Target Database Connection and Checkpoint Table
//!
//! Thin wrapper around tokio-postgres: connect once, drive the connection on
//! a background task, hand out transactions to the driver loop. The reserved
//! `cdc_checkpoint` table holds the resume point and is updated inside the
//! same transaction as each replayed payload, which is what makes
//! checkpoint-and-apply atomic. The table is created by the external schema
//! migration, not here; a single well-known row (id = 0) is used.

use tokio_postgres::{Client, NoTls, Transaction};
use tracing::{error, info};

use super::{classify_pg_error, Checkpoint, LoadError, Result};

const CHECKPOINT_UPSERT: &str = "INSERT INTO cdc_checkpoint (id, last_commit_lsn, oldest_active_xid, updated_at) \
     VALUES (0, $1, $2, now()) \
     ON CONFLICT (id) DO UPDATE \
     SET last_commit_lsn = EXCLUDED.last_commit_lsn, \
         oldest_active_xid = EXCLUDED.oldest_active_xid, \
         updated_at = EXCLUDED.updated_at";

const CHECKPOINT_SELECT: &str =
    "SELECT last_commit_lsn, oldest_active_xid FROM cdc_checkpoint WHERE id = 0";

pub struct TargetDb {
    client: Client,
}

impl TargetDb {
    /// Connect to the target and spawn the connection driver task
    pub async fn connect(uri: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(uri, NoTls)
            .await
            .map_err(|e| LoadError::Transient(format!("target connect failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Target connection task ended with error: {e}");
            }
        });
        info!("🐘 Connected to target database");
        Ok(Self { client })
    }

    pub async fn begin(&mut self) -> Result<Transaction<'_>> {
        self.client.transaction().await.map_err(classify_pg_error)
    }

    /// Read the persisted resume point, if any
    pub async fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let row = self
            .client
            .query_opt(CHECKPOINT_SELECT, &[])
            .await
            .map_err(classify_pg_error)?;
        Ok(row.map(|row| {
            let last_commit_lsn: i64 = row.get(0);
            let oldest_active_xid: i64 = row.get(1);
            Checkpoint {
                last_commit_lsn: last_commit_lsn as u64,
                oldest_active_xid: oldest_active_xid as u64,
            }
        }))
    }
}

/// Advance the checkpoint inside the payload's transaction. Failure here is
/// fatal for the pipeline: progressing without the checkpoint would break
/// resume idempotence.
pub async fn write_checkpoint(tx: &Transaction<'_>, checkpoint: &Checkpoint) -> Result<()> {
    tx.execute(
        CHECKPOINT_UPSERT,
        &[
            &(checkpoint.last_commit_lsn as i64),
            &(checkpoint.oldest_active_xid as i64),
        ],
    )
    .await
    .map_err(|e| LoadError::Checkpoint(e.to_string()))?;
    Ok(())
}
