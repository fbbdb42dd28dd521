//! Draft Action Family
//!
//! A draft edit is the narrowest write the deposit UI produces: one
//! `records_metadata` UPDATE whose `json` document actually changed (token
//! bookkeeping excluded). Broader `records_metadata` traffic (OAI set
//! touches, bulk no-op updates) is recognized by the ignored family instead.

use serde::Serialize;
use serde_json::Value;

use super::{shape_eq, ActionError, ActionPayload, Result, TOKEN_TABLE};
use crate::events::{OperationKind, Tx, WRITE_KINDS};

use crate::events::OperationKind::Update;

const DRAFT_EDIT_OPS: &[(&str, OperationKind)] = &[("records_metadata", Update)];

pub fn matches_draft_edit(tx: &Tx) -> bool {
    let ops = tx.ops_tuples(&[TOKEN_TABLE]);
    if !shape_eq(&ops, DRAFT_EDIT_OPS) {
        return false;
    }
    // the changed-column view only carries `json` when the document moved
    tx.last_row("records_metadata", &[Update], true)
        .map(|row| row.get("json").is_some())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize)]
pub struct DraftEditPayload {
    /// Source-side draft row id; the target row is resolved through the
    /// state store at load time
    pub draft_id: String,
    /// The full updated draft document
    pub json_patch: Value,
}

pub fn transform_draft_edit(tx: &Tx) -> Result<ActionPayload> {
    let fault = |reason: &str| ActionError::TransformFault {
        action: "draft-edit",
        reason: reason.to_string(),
    };
    let row = tx
        .last_row("records_metadata", WRITE_KINDS, false)
        .ok_or_else(|| fault("no records_metadata row"))?;
    let draft_id = row
        .get_str("id")
        .ok_or_else(|| fault("records_metadata row without id"))?
        .to_string();
    let json_patch = row
        .get("json")
        .cloned()
        .ok_or_else(|| fault("records_metadata row without json document"))?;
    Ok(ActionPayload::DraftEdit(DraftEditPayload {
        draft_id,
        json_patch,
    }))
}
