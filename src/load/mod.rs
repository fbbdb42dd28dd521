//! Load Stage: Transactional Replay Against the Target Database
//!
//! Each classified action is applied to the target database as exactly one
//! transaction. A loader exposes two halves:
//!
//! - `prepare(payload, state)` resolves cross-transaction references through
//!   the state store, mints fresh target ids, buffers state writes, and
//!   returns the SQL statements to execute. This half is also what
//!   `--dry-run` renders.
//! - `run(payload, tx, state)` executes the prepared statements on a live
//!   target transaction. The default implementation just replays `prepare`'s
//!   output in order.
//!
//! The driver owns the transactional discipline: begin, run the loader,
//! write the checkpoint row, commit, and only then publish the buffered
//! state writes. A failed commit drops the state scope, so the target and
//! the state store always move together.
//!
//! Target faults split into transient (deadlock, serialization, lost
//! connection, retried with backoff) and permanent (constraint violations,
//! which halt). A failed checkpoint write is fatal: advancing without it would
//! break resume idempotence.

pub mod loaders;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::actions::ActionPayload;
use crate::state::{StateError, StateScope};

pub use loaders::loader_for;
pub use postgres::TargetDb;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Transient target fault: {0}")]
    Transient(String),

    #[error("Permanent target fault: {0}")]
    Permanent(String),

    #[error("Checkpoint write failed: {0}")]
    Checkpoint(String),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

pub type Result<T> = std::result::Result<T, LoadError>;

impl LoadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Transient(_))
    }
}

/// Classify a driver error into the §transient/§permanent taxonomy.
/// Deadlocks, serialization failures and lost connections are worth a
/// retry; everything else (constraint violations above all) is not.
pub fn classify_pg_error(error: tokio_postgres::Error) -> LoadError {
    if error.is_closed() {
        return LoadError::Transient(format!("connection lost: {error}"));
    }
    if let Some(db_error) = error.as_db_error() {
        let code = db_error.code().code();
        // 40001 serialization_failure, 40P01 deadlock_detected
        if code == "40001" || code == "40P01" {
            return LoadError::Transient(db_error.to_string());
        }
        return LoadError::Permanent(db_error.to_string());
    }
    LoadError::Permanent(error.to_string())
}

/// The resume point, persisted in the reserved `cdc_checkpoint` table and
/// updated inside the same transaction as each payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_commit_lsn: u64,
    pub oldest_active_xid: u64,
}

/// One executable SQL statement with all values rendered as literals
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }
}

impl std::fmt::Display for SqlStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Quote a text literal for the target
pub(crate) fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Render an optional JSON scalar as a SQL literal
pub(crate) fn literal(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "NULL".to_string(),
        Some(Value::Bool(true)) => "TRUE".to_string(),
        Some(Value::Bool(false)) => "FALSE".to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => quote_literal(s),
        Some(other) => format!("{}::jsonb", quote_literal(&other.to_string())),
    }
}

/// Render a JSON document literal
pub(crate) fn json_literal(value: &Value) -> String {
    format!("{}::jsonb", quote_literal(&value.to_string()))
}

/// Render a source timestamp: connector output carries either epoch
/// microseconds or ISO text
pub(crate) fn timestamp_literal(value: Option<&Value>) -> String {
    match value {
        Some(Value::Number(n)) => {
            format!("to_timestamp({n}::double precision / 1000000)")
        }
        Some(Value::String(s)) => format!("{}::timestamptz", quote_literal(s)),
        _ => "now()".to_string(),
    }
}

/// A per-action applier. Implementations are stateless; everything they
/// need arrives through the payload and the transaction-scoped state.
#[async_trait]
pub trait ActionLoader: Send + Sync {
    /// Resolve references, mint ids, buffer state writes, and produce the
    /// statements to execute
    fn prepare(
        &self,
        payload: &ActionPayload,
        state: &mut StateScope<'_>,
    ) -> Result<Vec<SqlStatement>>;

    /// Execute against a live target transaction
    async fn run(
        &self,
        payload: &ActionPayload,
        tx: &tokio_postgres::Transaction<'_>,
        state: &mut StateScope<'_>,
    ) -> Result<()> {
        for statement in self.prepare(payload, state)? {
            tx.batch_execute(&statement.sql)
                .await
                .map_err(classify_pg_error)?;
        }
        Ok(())
    }
}
