//! Source Table Schemas
//!
//! The upstream log delivers row images as untyped JSON maps, and some
//! connector serializations flatten numerics and booleans into strings. This
//! module declares the column shape of every source table the pipeline cares
//! about and validates (and where needed coerces) row images at ingest, so
//! that everything downstream of the extractor works with typed values.
//!
//! Tables not declared here pass through untouched: the log carries plenty of
//! tables that only ever match ignored actions, and forcing a declaration for
//! each would buy nothing.

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::events::RowImage;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Column {table}.{column}: expected {expected}, got {found}")]
    TypeMismatch {
        table: String,
        column: String,
        expected: &'static str,
        found: String,
    },

    #[error("Column {table}.{column} is required but missing")]
    MissingColumn { table: String, column: String },
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Declared column types for source tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Boolean,
    Json,
    /// Timestamps arrive either as epoch integers or as ISO text; both pass
    Timestamp,
    /// UUIDs arrive as text; validated for shape only
    Uuid,
}

impl ColumnKind {
    fn name(self) -> &'static str {
        match self {
            ColumnKind::Text => "text",
            ColumnKind::Integer => "integer",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Json => "json",
            ColumnKind::Timestamp => "timestamp",
            ColumnKind::Uuid => "uuid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub required: bool,
}

const fn required(name: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec {
        name,
        kind,
        required: true,
    }
}

const fn optional(name: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec {
        name,
        kind,
        required: false,
    }
}

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub table: &'static str,
    pub columns: &'static [ColumnSpec],
}

static TABLE_SPECS: Lazy<HashMap<&'static str, &'static TableSpec>> = Lazy::new(|| {
    KNOWN_TABLES.iter().map(|spec| (spec.table, spec)).collect()
});

/// The source tables with declared shapes. Columns listed here are the ones
/// fingerprints and transforms read; everything else in a row image is
/// carried along unvalidated.
static KNOWN_TABLES: &[TableSpec] = &[
    TableSpec {
        table: "files_bucket",
        columns: &[
            required("id", ColumnKind::Uuid),
            optional("size", ColumnKind::Integer),
            optional("locked", ColumnKind::Boolean),
            optional("deleted", ColumnKind::Boolean),
            optional("created", ColumnKind::Timestamp),
            optional("updated", ColumnKind::Timestamp),
        ],
    },
    TableSpec {
        table: "files_object",
        columns: &[
            required("version_id", ColumnKind::Uuid),
            optional("bucket_id", ColumnKind::Uuid),
            optional("key", ColumnKind::Text),
            optional("file_id", ColumnKind::Uuid),
            optional("is_head", ColumnKind::Boolean),
            optional("created", ColumnKind::Timestamp),
            optional("updated", ColumnKind::Timestamp),
        ],
    },
    TableSpec {
        table: "files_files",
        columns: &[
            required("id", ColumnKind::Uuid),
            optional("uri", ColumnKind::Text),
            optional("size", ColumnKind::Integer),
            optional("checksum", ColumnKind::Text),
            optional("last_check", ColumnKind::Boolean),
            optional("last_check_at", ColumnKind::Timestamp),
            optional("created", ColumnKind::Timestamp),
            optional("updated", ColumnKind::Timestamp),
        ],
    },
    TableSpec {
        table: "records_metadata",
        columns: &[
            required("id", ColumnKind::Uuid),
            optional("json", ColumnKind::Json),
            optional("version_id", ColumnKind::Integer),
            optional("created", ColumnKind::Timestamp),
            optional("updated", ColumnKind::Timestamp),
        ],
    },
    TableSpec {
        table: "pidstore_pid",
        columns: &[
            required("id", ColumnKind::Integer),
            optional("pid_type", ColumnKind::Text),
            optional("pid_value", ColumnKind::Text),
            optional("status", ColumnKind::Text),
            optional("object_uuid", ColumnKind::Uuid),
        ],
    },
    TableSpec {
        table: "oauth2server_token",
        columns: &[
            required("id", ColumnKind::Integer),
            optional("user_id", ColumnKind::Integer),
            optional("last_used", ColumnKind::Timestamp),
        ],
    },
    TableSpec {
        table: "accounts_user",
        columns: &[
            required("id", ColumnKind::Integer),
            optional("active", ColumnKind::Boolean),
            optional("last_login_at", ColumnKind::Timestamp),
            optional("current_login_at", ColumnKind::Timestamp),
            optional("login_count", ColumnKind::Integer),
        ],
    },
    TableSpec {
        table: "accounts_user_session_activity",
        columns: &[
            required("sid_s", ColumnKind::Text),
            optional("user_id", ColumnKind::Integer),
            optional("created", ColumnKind::Timestamp),
            optional("updated", ColumnKind::Timestamp),
        ],
    },
    TableSpec {
        table: "github_repositories",
        columns: &[
            required("id", ColumnKind::Uuid),
            optional("ping", ColumnKind::Timestamp),
            optional("hook", ColumnKind::Integer),
            optional("updated", ColumnKind::Timestamp),
        ],
    },
    TableSpec {
        table: "oauthclient_remoteaccount",
        columns: &[
            required("id", ColumnKind::Integer),
            optional("user_id", ColumnKind::Integer),
            optional("extra_data", ColumnKind::Json),
        ],
    },
    TableSpec {
        table: "oauthclient_remotetoken",
        columns: &[
            required("id_remote_account", ColumnKind::Integer),
            optional("access_token", ColumnKind::Text),
        ],
    },
];

/// Validate a row image against its table's declared shape, coercing
/// string-encoded integers and booleans in place. Unknown tables are a no-op.
pub fn validate_row(table: &str, image: &mut RowImage) -> Result<()> {
    let Some(spec) = TABLE_SPECS.get(table) else {
        return Ok(());
    };
    for column in spec.columns {
        match image.get(column.name) {
            None | Some(Value::Null) => {
                if column.required && image.get(column.name).is_none() {
                    return Err(SchemaError::MissingColumn {
                        table: table.to_string(),
                        column: column.name.to_string(),
                    });
                }
            }
            Some(value) => {
                if let Some(coerced) = coerce(value, column.kind) {
                    image.insert(column.name.to_string(), coerced);
                } else if !matches(value, column.kind) {
                    return Err(SchemaError::TypeMismatch {
                        table: table.to_string(),
                        column: column.name.to_string(),
                        expected: column.kind.name(),
                        found: type_name(value).to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn matches(value: &Value, kind: ColumnKind) -> bool {
    match kind {
        ColumnKind::Text => value.is_string(),
        ColumnKind::Integer => value.is_i64() || value.is_u64(),
        ColumnKind::Boolean => value.is_boolean(),
        ColumnKind::Json => value.is_object() || value.is_array(),
        ColumnKind::Timestamp => value.is_string() || value.is_i64() || value.is_u64(),
        ColumnKind::Uuid => value
            .as_str()
            .map(|s| s.len() == 36 && s.bytes().filter(|b| *b == b'-').count() == 4)
            .unwrap_or(false),
    }
}

/// Returns a replacement value when a lossless coercion applies
fn coerce(value: &Value, kind: ColumnKind) -> Option<Value> {
    match (kind, value) {
        (ColumnKind::Integer, Value::String(s)) => {
            s.parse::<i64>().ok().map(|n| Value::Number(n.into()))
        }
        (ColumnKind::Boolean, Value::String(s)) => match s.as_str() {
            "true" | "t" => Some(Value::Bool(true)),
            "false" | "f" => Some(Value::Bool(false)),
            _ => None,
        },
        (ColumnKind::Json, Value::String(s)) => serde_json::from_str::<Value>(s)
            .ok()
            .filter(|v| v.is_object() || v.is_array()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
