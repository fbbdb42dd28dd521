//! File Action Family
//!
//! Fingerprints and transforms for file uploads and deletions, in both the
//! regular and the media ("extra format") variant. The two variants produce
//! the same core shape, so classification leans on two facts about the
//! source system: media files are only reachable through the token-
//! authenticated REST API (the transaction additionally updates
//! `oauth2server_token`), and the media object is stored under one reserved
//! MIME-typed key.
//!
//! Upload shapes come in an "add" and a "replace" flavor; replacement first
//! flips the previous object version's `is_head` to false. Deletions are
//! either hard (the object version row is removed) or soft (a delete-marker
//! version is inserted).

use serde::Serialize;
use serde_json::Value;

use super::{shape_eq, ActionError, ActionPayload, Result, TOKEN_TABLE};
use crate::events::OperationKind::{Delete, Insert, Update};
use crate::events::{OperationKind, RowImage, Tx, WRITE_KINDS};

/// The reserved object key under which media files are stored
pub const RESERVED_MEDIA_KEY: &str = "application/vnd.plazi.v1+xml";

const ADD_FILE_OPS: &[(&str, OperationKind)] = &[
    ("files_bucket", Update),
    ("files_object", Insert),
    ("files_files", Insert),
    ("files_object", Update),
    ("files_files", Update),
    ("files_bucket", Update),
];

const REPLACE_FILE_OPS: &[(&str, OperationKind)] = &[
    ("files_bucket", Update),
    ("files_object", Update), // previous head flips is_head = false
    ("files_object", Insert),
    ("files_files", Insert),
    ("files_object", Update),
    ("files_files", Update),
    ("files_bucket", Update),
];

const HARD_DELETE_OPS: &[(&str, OperationKind)] =
    &[("files_bucket", Update), ("files_object", Delete)];

const SOFT_DELETE_OPS: &[(&str, OperationKind)] = &[
    ("files_bucket", Update),
    ("files_object", Update),
    ("files_object", Insert), // delete marker
];

/// Media uploads ride the token-authenticated API, so the token update is
/// part of the fingerprint rather than excluded noise
const MEDIA_ADD_FILE_OPS: &[(&str, OperationKind)] = &[
    (TOKEN_TABLE, Update),
    ("files_bucket", Update),
    ("files_object", Insert),
    ("files_files", Insert),
    ("files_object", Update),
    ("files_files", Update),
    ("files_bucket", Update),
];

const MEDIA_REPLACE_FILE_OPS: &[(&str, OperationKind)] = &[
    (TOKEN_TABLE, Update),
    ("files_bucket", Update),
    ("files_object", Update),
    ("files_object", Insert),
    ("files_files", Insert),
    ("files_object", Update),
    ("files_files", Update),
    ("files_bucket", Update),
];

/// First media upload for a record also creates the media bucket and links it
const MEDIA_CREATE_BUCKET_OPS: &[(&str, OperationKind)] = &[
    (TOKEN_TABLE, Update),
    ("files_bucket", Insert),
    ("records_metadata", Update),
    ("records_buckets", Insert),
    ("files_bucket", Update),
    ("files_object", Insert),
    ("files_files", Insert),
    ("files_object", Update),
    ("files_files", Update),
    ("files_bucket", Update),
];

const MEDIA_HARD_DELETE_OPS: &[(&str, OperationKind)] = &[
    (TOKEN_TABLE, Update),
    ("files_bucket", Update),
    ("files_object", Delete),
];

const MEDIA_SOFT_DELETE_OPS: &[(&str, OperationKind)] = &[
    (TOKEN_TABLE, Update),
    ("files_bucket", Update),
    ("files_object", Update),
    ("files_object", Insert),
];

/// The last-touched object version's key, read from the unfiltered view so
/// an unchanged key column still participates in classification
fn object_key(tx: &Tx, kinds: &[OperationKind]) -> Option<String> {
    tx.last_row("files_object", kinds, false)
        .and_then(|row| row.get_str("key").map(str::to_string))
}

fn is_media_key(tx: &Tx, kinds: &[OperationKind]) -> bool {
    object_key(tx, kinds).as_deref() == Some(RESERVED_MEDIA_KEY)
}

pub fn matches_file_upload(tx: &Tx) -> bool {
    let ops = tx.ops_tuples(&[TOKEN_TABLE]);
    let is_file_upload = shape_eq(&ops, ADD_FILE_OPS) || shape_eq(&ops, REPLACE_FILE_OPS);
    // The same shape is produced by media uploads; those carry the reserved key
    is_file_upload && !is_media_key(tx, WRITE_KINDS)
}

pub fn matches_file_delete(tx: &Tx) -> bool {
    let ops = tx.ops_tuples(&[TOKEN_TABLE]);
    let is_file_deletion = shape_eq(&ops, HARD_DELETE_OPS) || shape_eq(&ops, SOFT_DELETE_OPS);
    is_file_deletion && !is_media_key(tx, &[Update, Delete])
}

pub fn matches_media_file_upload(tx: &Tx) -> bool {
    let ops = tx.ops_tuples(&[]);
    if shape_eq(&ops, MEDIA_CREATE_BUCKET_OPS) {
        return true;
    }
    let is_file_upload = shape_eq(&ops, MEDIA_ADD_FILE_OPS) || shape_eq(&ops, MEDIA_REPLACE_FILE_OPS);
    is_file_upload && is_media_key(tx, WRITE_KINDS)
}

pub fn matches_media_file_delete(tx: &Tx) -> bool {
    let ops = tx.ops_tuples(&[]);
    let is_file_deletion =
        shape_eq(&ops, MEDIA_HARD_DELETE_OPS) || shape_eq(&ops, MEDIA_SOFT_DELETE_OPS);
    is_file_deletion && is_media_key(tx, &[Update, Delete])
}

/// The target-side file record skeleton. The record id and the owning
/// draft/record id are minted and resolved at load time.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub created: Option<Value>,
    pub updated: Option<Value>,
    pub version_id: i64,
    pub key: String,
    pub object_version_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileUploadPayload {
    pub bucket: RowImage,
    pub object_version: RowImage,
    pub replaced_object_version: Option<RowImage>,
    pub file_instance: RowImage,
    pub file_record: FileRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaFileUploadPayload {
    pub upload: FileUploadPayload,
    /// The owning record's pid, present when the transaction also touched
    /// `records_metadata` (media bucket creation)
    pub pid_value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileDeletePayload {
    pub bucket: RowImage,
    pub deleted_object_version: RowImage,
    /// Present for soft deletions
    pub delete_marker_object_version: Option<RowImage>,
}

fn fault(action: &'static str, reason: impl Into<String>) -> ActionError {
    ActionError::TransformFault {
        action,
        reason: reason.into(),
    }
}

fn upload_payload(tx: &Tx, action: &'static str) -> Result<FileUploadPayload> {
    let bucket = tx
        .last_row("files_bucket", WRITE_KINDS, true)
        .ok_or_else(|| fault(action, "no files_bucket row"))?;
    let file_instance = tx
        .last_row("files_files", WRITE_KINDS, true)
        .ok_or_else(|| fault(action, "no files_files row"))?;
    let object_versions = tx.rows_grouped_by(
        "files_object",
        &["bucket_id", "key", "version_id"],
        WRITE_KINDS,
        true,
    );

    let is_replacement = object_versions.len() == 2;
    let mut replaced_object_version = None;
    let mut object_version = None;
    for ov in object_versions {
        if ov.get_bool("is_head") == Some(false) {
            replaced_object_version = Some(ov);
        } else {
            object_version = Some(ov);
        }
    }
    if is_replacement && replaced_object_version.is_none() {
        return Err(fault(action, "replacement without a dethroned head version"));
    }
    let object_version =
        object_version.ok_or_else(|| fault(action, "no current object version"))?;

    let file_record = FileRecord {
        created: object_version.get("created").cloned(),
        updated: object_version.get("updated").cloned(),
        version_id: 1,
        key: object_version
            .get_str("key")
            .ok_or_else(|| fault(action, "object version without a key"))?
            .to_string(),
        object_version_id: object_version
            .get_str("version_id")
            .ok_or_else(|| fault(action, "object version without a version_id"))?
            .to_string(),
    };

    Ok(FileUploadPayload {
        bucket,
        object_version,
        replaced_object_version,
        file_instance,
        file_record,
    })
}

pub fn transform_file_upload(tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::FileUpload(upload_payload(tx, "file-upload")?))
}

pub fn transform_media_file_upload(tx: &Tx) -> Result<ActionPayload> {
    let upload = upload_payload(tx, "media-file-upload")?;
    let pid_value = tx
        .last_row("records_metadata", WRITE_KINDS, false)
        .and_then(|record| {
            record
                .get("json")
                .and_then(|json| json.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    Ok(ActionPayload::MediaFileUpload(MediaFileUploadPayload {
        upload,
        pid_value,
    }))
}

fn delete_payload(tx: &Tx, action: &'static str) -> Result<FileDeletePayload> {
    let bucket = tx
        .last_row("files_bucket", WRITE_KINDS, true)
        .ok_or_else(|| fault(action, "no files_bucket row"))?;
    // full images: the dethroned version's file_id does not change during a
    // soft delete, and the marker is told apart by having none
    let object_versions = tx.rows_grouped_by(
        "files_object",
        &["bucket_id", "key", "version_id"],
        &[Update, Delete, Insert],
        false,
    );

    let is_soft_delete = object_versions.len() == 2;
    let mut delete_marker_object_version = None;
    let mut deleted_object_version = None;
    if is_soft_delete {
        for ov in object_versions {
            // the delete marker carries no file instance
            let has_file = !matches!(ov.get("file_id"), None | Some(Value::Null));
            if has_file {
                deleted_object_version = Some(ov);
            } else {
                delete_marker_object_version = Some(ov);
            }
        }
        if delete_marker_object_version.is_none() {
            return Err(fault(action, "soft delete without a delete marker"));
        }
    } else {
        deleted_object_version = object_versions.into_iter().last();
    }
    let deleted_object_version =
        deleted_object_version.ok_or_else(|| fault(action, "no deleted object version"))?;

    Ok(FileDeletePayload {
        bucket,
        deleted_object_version,
        delete_marker_object_version,
    })
}

pub fn transform_file_delete(tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::FileDelete(delete_payload(tx, "file-delete")?))
}

pub fn transform_media_file_delete(tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::MediaFileDelete(delete_payload(
        tx,
        "media-file-delete",
    )?))
}
