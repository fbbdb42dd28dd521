//! Per-Action Loaders
//!
//! One loader per substantive action plus the shared no-op loader for the
//! ignored family. Loaders never copy source primary keys into the target:
//! every target row gets a freshly minted UUID, and cross-transaction links
//! (which draft owns a bucket, which record a pid resolves to) go through
//! the state store. The draft's own bucket is addressed with a subselect on
//! the draft row rather than a second state namespace.

use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    json_literal, literal, quote_literal, timestamp_literal, ActionLoader, LoadError, Result,
    SqlStatement,
};
use crate::actions::files::{FileDeletePayload, FileUploadPayload};
use crate::actions::{ActionKind, ActionPayload};
use crate::state::StateScope;

/// Dispatch table from action kind to its applier
pub fn loader_for(kind: ActionKind) -> &'static dyn ActionLoader {
    match kind {
        ActionKind::FileUpload => &FileUploadLoader,
        ActionKind::MediaFileUpload => &MediaFileUploadLoader,
        ActionKind::FileDelete => &FileDeleteLoader,
        ActionKind::MediaFileDelete => &MediaFileDeleteLoader,
        ActionKind::DraftEdit => &DraftEditLoader,
        _ => &IgnoredLoader,
    }
}

fn wrong_payload(expected: &'static str) -> LoadError {
    LoadError::Permanent(format!("loader invoked with a non-{expected} payload"))
}

fn payload_field<'a>(
    image: &'a crate::events::RowImage,
    column: &str,
    what: &str,
) -> Result<&'a str> {
    image
        .get_str(column)
        .ok_or_else(|| LoadError::Permanent(format!("{what} is missing column {column}")))
}

/// Resolve the draft owning a source bucket through the `buckets` namespace
fn resolve_draft(state: &StateScope<'_>, bucket_id: &str) -> Result<String> {
    let entry = state.require("buckets", bucket_id)?;
    entry
        .get("draft_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LoadError::Permanent(format!("bucket entry for {bucket_id} has no draft_id")))
}

/// Statements shared by the regular and media upload paths. `files_table`
/// and `bucket_column` select which side of the draft the file lands on.
fn upload_statements(
    payload: &FileUploadPayload,
    draft_id: &str,
    files_table: &str,
    bucket_column: &str,
) -> Result<Vec<SqlStatement>> {
    let file_instance_id = Uuid::new_v4();
    let object_version_id = Uuid::new_v4();
    let file_record_id = Uuid::new_v4();

    let draft_bucket = format!(
        "(SELECT {bucket_column} FROM rdm_drafts_metadata WHERE id = {})",
        quote_literal(draft_id)
    );

    let mut statements = Vec::new();
    statements.push(SqlStatement::new(format!(
        "INSERT INTO files_files (id, uri, storage_class, size, checksum, created, updated) \
         VALUES ('{file_instance_id}', {uri}, {storage_class}, {size}, {checksum}, {created}, {updated})",
        uri = literal(payload.file_instance.get("uri")),
        storage_class = literal(payload.file_instance.get("storage_class")),
        size = literal(payload.file_instance.get("size")),
        checksum = literal(payload.file_instance.get("checksum")),
        created = timestamp_literal(payload.file_instance.get("created")),
        updated = timestamp_literal(payload.file_instance.get("updated")),
    )));

    if payload.replaced_object_version.is_some() {
        statements.push(SqlStatement::new(format!(
            "UPDATE files_objectversion SET is_head = FALSE \
             WHERE bucket_id = {draft_bucket} AND key = {key} AND is_head = TRUE",
            key = literal(Some(&Value::String(payload.file_record.key.clone()))),
        )));
    }

    statements.push(SqlStatement::new(format!(
        "INSERT INTO files_objectversion (version_id, bucket_id, key, file_id, is_head, created, updated) \
         VALUES ('{object_version_id}', {draft_bucket}, {key}, '{file_instance_id}', TRUE, {created}, {updated})",
        key = literal(Some(&Value::String(payload.file_record.key.clone()))),
        created = timestamp_literal(payload.object_version.get("created")),
        updated = timestamp_literal(payload.object_version.get("updated")),
    )));

    statements.push(SqlStatement::new(format!(
        "INSERT INTO {files_table} (id, json, created, updated, version_id, key, record_id, object_version_id) \
         VALUES ('{file_record_id}', '{{}}'::jsonb, {created}, {updated}, {version}, {key}, {record}, '{object_version_id}')",
        created = timestamp_literal(payload.file_record.created.as_ref()),
        updated = timestamp_literal(payload.file_record.updated.as_ref()),
        version = payload.file_record.version_id,
        key = quote_literal(&payload.file_record.key),
        record = quote_literal(draft_id),
    )));

    statements.push(SqlStatement::new(format!(
        "UPDATE files_bucket SET size = {size}, updated = {updated} WHERE id = {draft_bucket}",
        size = literal(payload.bucket.get("size")),
        updated = timestamp_literal(payload.bucket.get("updated")),
    )));

    Ok(statements)
}

pub struct FileUploadLoader;

impl ActionLoader for FileUploadLoader {
    fn prepare(
        &self,
        payload: &ActionPayload,
        state: &mut StateScope<'_>,
    ) -> Result<Vec<SqlStatement>> {
        let ActionPayload::FileUpload(payload) = payload else {
            return Err(wrong_payload("file-upload"));
        };
        let bucket_id = payload_field(&payload.bucket, "id", "bucket row")?;
        let draft_id = resolve_draft(state, bucket_id)?;
        upload_statements(payload, &draft_id, "rdm_drafts_files", "bucket_id")
    }
}

pub struct MediaFileUploadLoader;

impl ActionLoader for MediaFileUploadLoader {
    fn prepare(
        &self,
        payload: &ActionPayload,
        state: &mut StateScope<'_>,
    ) -> Result<Vec<SqlStatement>> {
        let ActionPayload::MediaFileUpload(payload) = payload else {
            return Err(wrong_payload("media-file-upload"));
        };
        let bucket_id = payload_field(&payload.upload.bucket, "id", "bucket row")?;
        // First media upload for a record arrives before any bucket→draft
        // link exists; the record pid establishes it.
        let draft_id = match state.get("buckets", bucket_id)? {
            Some(entry) => entry
                .get("draft_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    LoadError::Permanent(format!("bucket entry for {bucket_id} has no draft_id"))
                })?,
            None => {
                let pid_value = payload.pid_value.as_deref().ok_or_else(|| {
                    LoadError::State(crate::state::StateError::Missing {
                        namespace: "buckets".to_string(),
                        key: bucket_id.to_string(),
                    })
                })?;
                let record = state.require("pids", pid_value)?;
                let draft_id = record
                    .get("record_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        LoadError::Permanent(format!("pid entry for {pid_value} has no record_id"))
                    })?;
                state.set("buckets", bucket_id, json!({"draft_id": draft_id}))?;
                draft_id
            }
        };
        upload_statements(
            &payload.upload,
            &draft_id,
            "rdm_records_media_files",
            "media_bucket_id",
        )
    }
}

fn delete_statements(
    payload: &FileDeletePayload,
    draft_id: &str,
    files_table: &str,
    bucket_column: &str,
) -> Result<Vec<SqlStatement>> {
    let key = payload_field(&payload.deleted_object_version, "key", "deleted object version")?;
    let draft_bucket = format!(
        "(SELECT {bucket_column} FROM rdm_drafts_metadata WHERE id = {})",
        quote_literal(draft_id)
    );

    let mut statements = Vec::new();
    match &payload.delete_marker_object_version {
        // soft delete: dethrone the head and insert the marker version
        Some(marker) => {
            let marker_id = Uuid::new_v4();
            statements.push(SqlStatement::new(format!(
                "UPDATE files_objectversion SET is_head = FALSE \
                 WHERE bucket_id = {draft_bucket} AND key = {key} AND is_head = TRUE",
                key = quote_literal(key),
            )));
            statements.push(SqlStatement::new(format!(
                "INSERT INTO files_objectversion (version_id, bucket_id, key, file_id, is_head, created, updated) \
                 VALUES ('{marker_id}', {draft_bucket}, {key}, NULL, TRUE, {created}, {updated})",
                key = quote_literal(key),
                created = timestamp_literal(marker.get("created")),
                updated = timestamp_literal(marker.get("updated")),
            )));
        }
        // hard delete: the version row goes away entirely
        None => {
            statements.push(SqlStatement::new(format!(
                "DELETE FROM files_objectversion WHERE bucket_id = {draft_bucket} AND key = {key}",
                key = quote_literal(key),
            )));
        }
    }
    statements.push(SqlStatement::new(format!(
        "DELETE FROM {files_table} WHERE record_id = {record} AND key = {key}",
        record = quote_literal(draft_id),
        key = quote_literal(key),
    )));
    statements.push(SqlStatement::new(format!(
        "UPDATE files_bucket SET size = {size}, updated = {updated} WHERE id = {draft_bucket}",
        size = literal(payload.bucket.get("size")),
        updated = timestamp_literal(payload.bucket.get("updated")),
    )));
    Ok(statements)
}

pub struct FileDeleteLoader;

impl ActionLoader for FileDeleteLoader {
    fn prepare(
        &self,
        payload: &ActionPayload,
        state: &mut StateScope<'_>,
    ) -> Result<Vec<SqlStatement>> {
        let ActionPayload::FileDelete(payload) = payload else {
            return Err(wrong_payload("file-delete"));
        };
        let bucket_id = payload_field(&payload.bucket, "id", "bucket row")?;
        let draft_id = resolve_draft(state, bucket_id)?;
        delete_statements(payload, &draft_id, "rdm_drafts_files", "bucket_id")
    }
}

pub struct MediaFileDeleteLoader;

impl ActionLoader for MediaFileDeleteLoader {
    fn prepare(
        &self,
        payload: &ActionPayload,
        state: &mut StateScope<'_>,
    ) -> Result<Vec<SqlStatement>> {
        let ActionPayload::MediaFileDelete(payload) = payload else {
            return Err(wrong_payload("media-file-delete"));
        };
        let bucket_id = payload_field(&payload.bucket, "id", "bucket row")?;
        let draft_id = resolve_draft(state, bucket_id)?;
        delete_statements(
            payload,
            &draft_id,
            "rdm_records_media_files",
            "media_bucket_id",
        )
    }
}

pub struct DraftEditLoader;

impl ActionLoader for DraftEditLoader {
    fn prepare(
        &self,
        payload: &ActionPayload,
        state: &mut StateScope<'_>,
    ) -> Result<Vec<SqlStatement>> {
        let ActionPayload::DraftEdit(payload) = payload else {
            return Err(wrong_payload("draft-edit"));
        };
        let entry = state.require("drafts", &payload.draft_id)?;
        let target_id = entry
            .get("draft_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                LoadError::Permanent(format!(
                    "draft entry for {} has no draft_id",
                    payload.draft_id
                ))
            })?;
        Ok(vec![SqlStatement::new(format!(
            "UPDATE rdm_drafts_metadata SET json = {json}, version_id = version_id + 1, updated = now() \
             WHERE id = {id}",
            json = json_literal(&payload.json_patch),
            id = quote_literal(target_id),
        ))])
    }
}

/// The shared applier for the ignored family: nothing to execute, nothing
/// to record beyond the checkpoint the driver writes anyway
pub struct IgnoredLoader;

impl ActionLoader for IgnoredLoader {
    fn prepare(
        &self,
        _payload: &ActionPayload,
        _state: &mut StateScope<'_>,
    ) -> Result<Vec<SqlStatement>> {
        Ok(Vec::new())
    }
}
