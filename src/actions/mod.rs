//! Action Classification and Transformation
//!
//! Every reassembled transaction is fingerprinted against a closed registry
//! of actions. A fingerprint has two layers: the ordered `(table, kind)`
//! shape of the transaction (optionally after excluding noise tables), and a
//! content predicate that inspects row fields to break shape collisions.
//! The classic collision is a file upload versus a media-file upload,
//! distinguished by the reserved MIME key and the auth-token update that
//! only the media REST path produces.
//!
//! The registry is an ordered list of `(kind, matches, transform)` entries;
//! the first match wins. Strictly more specific actions come first (media
//! variants before generic file actions), and the ignored family (actions
//! whose whole purpose is to recognize transactions with no target-side
//! meaning) comes last, so it can only match when nothing substantive does.
//!
//! Transforms are pure functions from a transaction to a typed payload. They
//! never perform I/O and never touch the state store; anything that needs a
//! cross-transaction fact (bucket → draft links, minted ids) is resolved at
//! load time.

pub mod drafts;
pub mod files;
pub mod ignored;

use serde::Serialize;
use thiserror::Error;

use crate::events::Tx;
use drafts::DraftEditPayload;
use files::{FileDeletePayload, FileUploadPayload, MediaFileUploadPayload};

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("No registered action matches xid={xid} (shape: {shape})")]
    Unclassified { xid: u64, shape: String },

    #[error("Transform for {action} failed: {reason}")]
    TransformFault {
        action: &'static str,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ActionError>;

/// Tables excluded from shapes because the REST API touches them on every
/// authenticated request
pub const TOKEN_TABLE: &str = "oauth2server_token";

/// The closed set of recognized actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActionKind {
    // Substantive actions, most specific first
    MediaFileUpload,
    MediaFileDelete,
    FileUpload,
    FileDelete,
    DraftEdit,
    // Ignored actions: recognized and dropped
    FileChecksum,
    UserSession,
    GitHubSync,
    GitHubPing,
    OAuthReLogin,
    DoiRegistration,
    MultiRecordNoop,
    BucketNoop,
}

impl ActionKind {
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::MediaFileUpload => "media-file-upload",
            ActionKind::MediaFileDelete => "media-file-delete",
            ActionKind::FileUpload => "file-upload",
            ActionKind::FileDelete => "file-delete",
            ActionKind::DraftEdit => "draft-edit",
            ActionKind::FileChecksum => "file-checksum",
            ActionKind::UserSession => "user-session",
            ActionKind::GitHubSync => "gh-sync",
            ActionKind::GitHubPing => "gh-ping",
            ActionKind::OAuthReLogin => "oauth-relogin",
            ActionKind::DoiRegistration => "doi-registration",
            ActionKind::MultiRecordNoop => "multi-record-noop-updates",
            ActionKind::BucketNoop => "bucket-noop",
        }
    }

    /// Ignored actions produce no target-side writes
    pub fn is_ignored(self) -> bool {
        matches!(
            self,
            ActionKind::FileChecksum
                | ActionKind::UserSession
                | ActionKind::GitHubSync
                | ActionKind::GitHubPing
                | ActionKind::OAuthReLogin
                | ActionKind::DoiRegistration
                | ActionKind::MultiRecordNoop
                | ActionKind::BucketNoop
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The typed payload produced by an action's transform
#[derive(Debug, Clone, Serialize)]
pub enum ActionPayload {
    FileUpload(FileUploadPayload),
    FileDelete(FileDeletePayload),
    MediaFileUpload(MediaFileUploadPayload),
    MediaFileDelete(FileDeletePayload),
    DraftEdit(DraftEditPayload),
    /// Ignored actions carry nothing but their classification
    Ignored(ActionKind),
}

/// One registry entry: a fingerprint predicate and a pure transform
pub struct ActionEntry {
    pub kind: ActionKind,
    pub matches: fn(&Tx) -> bool,
    pub transform: fn(&Tx) -> Result<ActionPayload>,
}

/// The registry in dispatch order. Order is part of the contract: specific
/// before generic, ignored last.
pub static REGISTRY: &[ActionEntry] = &[
    ActionEntry {
        kind: ActionKind::MediaFileUpload,
        matches: files::matches_media_file_upload,
        transform: files::transform_media_file_upload,
    },
    ActionEntry {
        kind: ActionKind::MediaFileDelete,
        matches: files::matches_media_file_delete,
        transform: files::transform_media_file_delete,
    },
    ActionEntry {
        kind: ActionKind::FileUpload,
        matches: files::matches_file_upload,
        transform: files::transform_file_upload,
    },
    ActionEntry {
        kind: ActionKind::FileDelete,
        matches: files::matches_file_delete,
        transform: files::transform_file_delete,
    },
    ActionEntry {
        kind: ActionKind::DraftEdit,
        matches: drafts::matches_draft_edit,
        transform: drafts::transform_draft_edit,
    },
    ActionEntry {
        kind: ActionKind::FileChecksum,
        matches: ignored::matches_file_checksum,
        transform: ignored::transform_file_checksum,
    },
    ActionEntry {
        kind: ActionKind::UserSession,
        matches: ignored::matches_user_session,
        transform: ignored::transform_user_session,
    },
    ActionEntry {
        kind: ActionKind::GitHubSync,
        matches: ignored::matches_github_sync,
        transform: ignored::transform_github_sync,
    },
    ActionEntry {
        kind: ActionKind::GitHubPing,
        matches: ignored::matches_github_ping,
        transform: ignored::transform_github_ping,
    },
    ActionEntry {
        kind: ActionKind::OAuthReLogin,
        matches: ignored::matches_oauth_relogin,
        transform: ignored::transform_oauth_relogin,
    },
    ActionEntry {
        kind: ActionKind::DoiRegistration,
        matches: ignored::matches_doi_registration,
        transform: ignored::transform_doi_registration,
    },
    ActionEntry {
        kind: ActionKind::MultiRecordNoop,
        matches: ignored::matches_multi_record_noop,
        transform: ignored::transform_multi_record_noop,
    },
    ActionEntry {
        kind: ActionKind::BucketNoop,
        matches: ignored::matches_bucket_noop,
        transform: ignored::transform_bucket_noop,
    },
];

/// A classified transaction ready for loading
#[derive(Debug)]
pub struct RoutedAction {
    pub kind: ActionKind,
    pub payload: ActionPayload,
}

/// Find the first matching action, or `None` for an unclassified transaction
pub fn classify(tx: &Tx) -> Option<ActionKind> {
    REGISTRY
        .iter()
        .find(|entry| (entry.matches)(tx))
        .map(|entry| entry.kind)
}

/// Classify and transform in one step
pub fn route(tx: &Tx) -> Result<RoutedAction> {
    for entry in REGISTRY {
        if (entry.matches)(tx) {
            let payload = (entry.transform)(tx)?;
            return Ok(RoutedAction {
                kind: entry.kind,
                payload,
            });
        }
    }
    Err(ActionError::Unclassified {
        xid: tx.xid,
        shape: format!("{:?}", tx.ops_tuples(&[])),
    })
}

/// Compare an observed shape against a literal template, order-sensitive
pub(crate) fn shape_eq(
    observed: &[(&str, crate::events::OperationKind)],
    template: &[(&str, crate::events::OperationKind)],
) -> bool {
    observed == template
}
