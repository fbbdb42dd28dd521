//! Change Event Model
//!
//! Core data types for the pipeline: row-level change operations, transaction
//! boundary records, and reassembled logical transactions. The wire format
//! follows the Debezium envelope convention used by the upstream log:
//!
//! - Row operations carry a JSON `key` (the composite primary key), an `op`
//!   letter (`c`/`u`/`d`/`r`), optional `before`/`after` row images, and a
//!   `source` block with `{schema, table, txId, lsn}`.
//! - Boundary records carry `{status: "END", id: "<xid>:<commit_lsn>",
//!   event_count}`; the composite id is the PostgreSQL connector convention
//!   and is parsed into both halves.
//!
//! Row images are promoted from raw JSON maps to [`RowImage`] values at
//! ingest; per-table validation lives in the `schema` module. The [`Tx`]
//! views (`ops_tuples`, `rows_by_key`, `rows_grouped_by`) are what action
//! fingerprints and transforms consume.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventError {
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field in event payload: {0}")]
    MissingField(String),

    #[error("Unknown operation letter: {0}")]
    UnknownOperation(String),

    #[error("Malformed boundary id (expected \"<xid>:<commit_lsn>\"): {0}")]
    InvalidBoundaryId(String),

    #[error("Row image invariant violated for {kind:?} on {table}: {reason}")]
    ImageInvariant {
        kind: OperationKind,
        table: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, EventError>;

/// Debezium internal key column that must never leak into primary keys
const DBZ_TABLE_IDENTIFIER: &str = "__dbz__physicalTableIdentifier";

/// Row operation kinds as they appear on the ops topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Read,
}

impl OperationKind {
    /// Map a wire letter (`c`, `u`, `d`, `r`, case-insensitive) to a kind
    pub fn from_wire(letter: &str) -> Option<Self> {
        match letter.to_ascii_lowercase().as_str() {
            "c" => Some(OperationKind::Insert),
            "u" => Some(OperationKind::Update),
            "d" => Some(OperationKind::Delete),
            "r" => Some(OperationKind::Read),
            _ => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Insert => f.write_str("INSERT"),
            OperationKind::Update => f.write_str("UPDATE"),
            OperationKind::Delete => f.write_str("DELETE"),
            OperationKind::Read => f.write_str("READ"),
        }
    }
}

/// Kinds that carry a current row image; the default filter for row views
pub const WRITE_KINDS: &[OperationKind] = &[OperationKind::Insert, OperationKind::Update];

/// A single row image: ordered column → JSON value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowImage(pub Map<String, Value>);

impl RowImage {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(Value::as_str)
    }

    pub fn get_u64(&self, column: &str) -> Option<u64> {
        self.0.get(column).and_then(Value::as_u64)
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.0.get(column).and_then(Value::as_bool)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn insert(&mut self, column: String, value: Value) {
        self.0.insert(column, value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay another image on top of this one (last writer wins per column)
    pub fn merge_from(&mut self, other: &RowImage) {
        for (column, value) in &other.0 {
            self.0.insert(column.clone(), value.clone());
        }
    }
}

impl From<Map<String, Value>> for RowImage {
    fn from(map: Map<String, Value>) -> Self {
        RowImage(map)
    }
}

/// A single row change pulled off the ops topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub source_schema: String,
    pub source_table: String,
    pub kind: OperationKind,
    /// Composite primary key as structured JSON
    pub key: Value,
    pub before: Option<RowImage>,
    pub after: Option<RowImage>,
    pub xid: u64,
    pub lsn: u64,
    /// Back-filled from the matching boundary record at assembly time
    pub commit_lsn: Option<u64>,
}

impl Operation {
    /// Check the kind/image invariants: INSERT has only `after`, DELETE only
    /// `before`, UPDATE both. READ rows behave like INSERT snapshots.
    pub fn check_images(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(EventError::ImageInvariant {
                kind: self.kind,
                table: self.source_table.clone(),
                reason: reason.to_string(),
            })
        };
        match self.kind {
            OperationKind::Insert | OperationKind::Read => {
                if self.after.is_none() {
                    return fail("missing after image");
                }
                if self.before.is_some() {
                    return fail("unexpected before image");
                }
            }
            OperationKind::Delete => {
                if self.before.is_none() {
                    return fail("missing before image");
                }
                if self.after.is_some() {
                    return fail("unexpected after image");
                }
            }
            OperationKind::Update => {
                if self.before.is_none() || self.after.is_none() {
                    return fail("update requires both images");
                }
            }
        }
        Ok(())
    }

    /// The current row: `after` where present, otherwise `before`
    pub fn row(&self) -> Option<&RowImage> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Key columns as strings, used to exempt primary-key columns from
    /// changed-column filtering
    fn key_columns(&self) -> Vec<&str> {
        match &self.key {
            Value::Object(map) => map.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Project the row image for merged views. With `filter_unchanged`, an
    /// UPDATE keeps only the columns whose value actually changed, plus the
    /// primary-key columns; INSERT/DELETE images always pass through whole.
    fn view_image(&self, filter_unchanged: bool) -> Option<RowImage> {
        let full = self.row()?;
        if !filter_unchanged || self.kind != OperationKind::Update {
            return Some(full.clone());
        }
        let before = self.before.as_ref()?;
        let key_columns = self.key_columns();
        let mut image = RowImage::default();
        for (column, value) in &full.0 {
            let changed = before.get(column) != Some(value);
            if changed || key_columns.contains(&column.as_str()) {
                image.insert(column.clone(), value.clone());
            }
        }
        Some(image)
    }
}

/// A transaction boundary record from the tx topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInfo {
    pub xid: u64,
    pub commit_lsn: u64,
    pub event_count: usize,
}

/// A reassembled logical transaction, emitted by the extractor in commit
/// order with operations sorted by per-op `lsn`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tx {
    pub xid: u64,
    pub commit_lsn: u64,
    pub operations: Vec<Operation>,
}

impl Tx {
    /// The ordered `(table, kind)` shape of the transaction, after dropping
    /// any tables in `exclude`. This is the first layer of every fingerprint.
    pub fn ops_tuples(&self, exclude: &[&str]) -> Vec<(&str, OperationKind)> {
        self.operations
            .iter()
            .filter(|op| !exclude.contains(&op.source_table.as_str()))
            .map(|op| (op.source_table.as_str(), op.kind))
            .collect()
    }

    /// The `(table, kind)` tuples restricted to `include` tables and `kinds`
    pub fn filtered_tuples(
        &self,
        include: &[&str],
        kinds: &[OperationKind],
    ) -> Vec<(&str, OperationKind)> {
        self.operations
            .iter()
            .filter(|op| include.contains(&op.source_table.as_str()) && kinds.contains(&op.kind))
            .map(|op| (op.source_table.as_str(), op.kind))
            .collect()
    }

    fn table_ops<'a>(
        &'a self,
        table: &'a str,
        kinds: &'a [OperationKind],
    ) -> impl Iterator<Item = &'a Operation> + 'a {
        self.operations
            .iter()
            .filter(move |op| op.source_table == table && kinds.contains(&op.kind))
    }

    /// Last-writer-wins rows for a table, keyed by serialized primary key,
    /// in the order each key was first touched. Later operations on the same
    /// key overlay earlier ones column by column.
    pub fn rows_by_key(
        &self,
        table: &str,
        kinds: &[OperationKind],
        filter_unchanged: bool,
    ) -> Vec<(String, RowImage)> {
        let mut order: Vec<String> = Vec::new();
        let mut merged: std::collections::HashMap<String, RowImage> =
            std::collections::HashMap::new();
        for op in self.table_ops(table, kinds) {
            let Some(image) = op.view_image(filter_unchanged) else {
                continue;
            };
            let key = op.key.to_string();
            match merged.get_mut(&key) {
                Some(existing) => existing.merge_from(&image),
                None => {
                    order.push(key.clone());
                    merged.insert(key, image);
                }
            }
        }
        order
            .into_iter()
            .map(|key| {
                let image = merged.remove(&key).unwrap_or_default();
                (key, image)
            })
            .collect()
    }

    /// The merged row for the key touched last (the `popitem()` view)
    pub fn last_row(
        &self,
        table: &str,
        kinds: &[OperationKind],
        filter_unchanged: bool,
    ) -> Option<RowImage> {
        self.rows_by_key(table, kinds, filter_unchanged)
            .pop()
            .map(|(_, image)| image)
    }

    /// Rows for a table merged by a tuple of grouping columns rather than by
    /// primary key. Grouping values are read from the full row image so that
    /// unchanged columns still group correctly.
    pub fn rows_grouped_by(
        &self,
        table: &str,
        group_columns: &[&str],
        kinds: &[OperationKind],
        filter_unchanged: bool,
    ) -> Vec<RowImage> {
        let mut order: Vec<String> = Vec::new();
        let mut merged: std::collections::HashMap<String, RowImage> =
            std::collections::HashMap::new();
        for op in self.table_ops(table, kinds) {
            let Some(full) = op.row() else { continue };
            let group_key: Vec<String> = group_columns
                .iter()
                .map(|column| full.get(column).map(Value::to_string).unwrap_or_default())
                .collect();
            let group_key = group_key.join("\u{1f}");
            let Some(image) = op.view_image(filter_unchanged) else {
                continue;
            };
            match merged.get_mut(&group_key) {
                Some(existing) => existing.merge_from(&image),
                None => {
                    order.push(group_key.clone());
                    merged.insert(group_key, image);
                }
            }
        }
        order
            .into_iter()
            .filter_map(|key| merged.remove(&key))
            .collect()
    }

    /// Count distinct primary keys touched for a table
    pub fn distinct_keys(&self, table: &str, kinds: &[OperationKind]) -> usize {
        let mut keys: Vec<String> = self
            .table_ops(table, kinds)
            .map(|op| op.key.to_string())
            .collect();
        keys.sort();
        keys.dedup();
        keys.len()
    }
}

/// A raw record pulled from a topic: JSON key plus JSON payload
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub key: Value,
    pub payload: Value,
}

impl LogRecord {
    /// Decode one newline-delimited JSON line. Two envelope layouts occur in
    /// topic dumps: `{"key": "<json string>", "payload": "<json string>"}`
    /// (raw consumer output) and `{"key": {...}, "value": {...}}` (already
    /// decoded). Both are accepted.
    pub fn from_line(line: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(line)?;
        let key = match raw.get("key") {
            Some(Value::String(s)) => serde_json::from_str(s)?,
            Some(other) => other.clone(),
            None => return Err(EventError::MissingField("key".to_string())),
        };
        let payload = match (raw.get("payload"), raw.get("value")) {
            (Some(Value::String(s)), _) => serde_json::from_str(s)?,
            (Some(other), _) => other.clone(),
            (None, Some(value)) => value.clone(),
            (None, None) => return Err(EventError::MissingField("payload".to_string())),
        };
        Ok(LogRecord { key, payload })
    }

    /// Parse an ops-topic record into an [`Operation`]
    pub fn into_operation(self) -> Result<Operation> {
        let payload = self.payload;
        let source = payload
            .get("source")
            .and_then(Value::as_object)
            .ok_or_else(|| EventError::MissingField("source".to_string()))?;

        let field_str = |map: &Map<String, Value>, name: &str| -> Result<String> {
            map.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| EventError::MissingField(format!("source.{name}")))
        };
        let field_u64 = |map: &Map<String, Value>, name: &str| -> Result<u64> {
            map.get(name)
                .and_then(Value::as_u64)
                .ok_or_else(|| EventError::MissingField(format!("source.{name}")))
        };

        let op_letter = payload
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MissingField("op".to_string()))?;
        let kind = OperationKind::from_wire(op_letter)
            .ok_or_else(|| EventError::UnknownOperation(op_letter.to_string()))?;

        let mut key = self.key;
        if let Value::Object(map) = &mut key {
            map.remove(DBZ_TABLE_IDENTIFIER);
        }

        let image = |name: &str| -> Option<RowImage> {
            match payload.get(name) {
                Some(Value::Object(map)) => Some(RowImage(map.clone())),
                _ => None,
            }
        };

        let operation = Operation {
            source_schema: field_str(source, "schema")?,
            source_table: field_str(source, "table")?,
            kind,
            key,
            before: image("before"),
            after: image("after"),
            xid: field_u64(source, "txId")?,
            lsn: field_u64(source, "lsn")?,
            commit_lsn: source.get("commit_lsn").and_then(Value::as_u64),
        };
        operation.check_images()?;
        Ok(operation)
    }

    /// Parse a tx-topic record into a [`TxInfo`]. Returns `None` for
    /// non-terminal statuses (`BEGIN` markers carry no event count).
    pub fn into_tx_info(self) -> Result<Option<TxInfo>> {
        let payload = self.payload;
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MissingField("status".to_string()))?;
        if status != "END" {
            return Ok(None);
        }
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MissingField("id".to_string()))?;
        let (xid, commit_lsn) = id
            .split_once(':')
            .and_then(|(xid, lsn)| Some((xid.parse::<u64>().ok()?, lsn.parse::<u64>().ok()?)))
            .ok_or_else(|| EventError::InvalidBoundaryId(id.to_string()))?;
        let event_count = payload
            .get("event_count")
            .and_then(Value::as_u64)
            .ok_or_else(|| EventError::MissingField("event_count".to_string()))?
            as usize;
        Ok(Some(TxInfo {
            xid,
            commit_lsn,
            event_count,
        }))
    }
}
