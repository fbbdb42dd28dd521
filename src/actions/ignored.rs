//! Ignored Action Family
//!
//! Fingerprints for transactions that are real on the source but carry no
//! meaning for the target schema: checksum bookkeeping, session activity,
//! periodic service pings, OAuth re-logins, DOI registration status flips
//! already reflected elsewhere, and bulk no-op record touches. Recognizing
//! these explicitly is what makes an unclassified transaction a signal
//! instead of noise: anything that falls through here is genuinely unknown.
//!
//! Every fingerprint uses the same two-layer mechanism as the substantive
//! actions and each transform produces the empty payload.

use super::{shape_eq, ActionKind, ActionPayload, Result};
use crate::events::{OperationKind, Tx, WRITE_KINDS};

use crate::events::OperationKind::{Insert, Update};

/// DOI prefixes the source registers through DataCite (production and the
/// DataCite sandbox)
pub const DATACITE_PREFIXES: &[&str] = &["10.5281/", "10.5072/"];

/// Changed columns of a single-row view, primary key aside
fn changed_columns(tx: &Tx, table: &str, key_column: &str) -> Option<Vec<String>> {
    let row = tx.last_row(table, WRITE_KINDS, true)?;
    Some(
        row.columns()
            .filter(|column| *column != key_column)
            .map(str::to_string)
            .collect(),
    )
}

/// A single file-instance update that only touched checksum bookkeeping
pub fn matches_file_checksum(tx: &Tx) -> bool {
    if !shape_eq(&tx.ops_tuples(&[]), &[("files_files", Update)]) {
        return false;
    }
    let Some(changed) = changed_columns(tx, "files_files", "id") else {
        return false;
    };
    changed
        .iter()
        .all(|column| matches!(column.as_str(), "last_check" | "last_check_at" | "updated"))
}

/// Session-activity writes, optionally with one user row update, but never
/// a deactivation, which must surface as unclassified
pub fn matches_user_session(tx: &Tx) -> bool {
    let ops = tx.ops_tuples(&[]);
    let user_updates = tx.filtered_tuples(&["accounts_user"], &[Update]);
    let session_ops =
        tx.filtered_tuples(&["accounts_user_session_activity"], &[Insert, Update]);
    if user_updates.len() == 1 {
        if let Some(user) = tx.last_row("accounts_user", &[Update], false) {
            if user.get_bool("active") == Some(false) {
                return false;
            }
        }
    }
    ops.len() == user_updates.len() + session_ops.len() && !session_ops.is_empty()
}

/// One OAuth remote-account update plus any number of repository updates
pub fn matches_github_sync(tx: &Tx) -> bool {
    let ops = tx.ops_tuples(&[]);
    let account_updates = ops
        .iter()
        .filter(|tuple| **tuple == ("oauthclient_remoteaccount", Update))
        .count();
    let repo_updates = ops
        .iter()
        .filter(|tuple| **tuple == ("github_repositories", Update))
        .count();
    account_updates == 1 && ops.len() == account_updates + repo_updates
}

/// A single repository update that only touched the ping column
pub fn matches_github_ping(tx: &Tx) -> bool {
    if !shape_eq(&tx.ops_tuples(&[]), &[("github_repositories", Update)]) {
        return false;
    }
    let Some(mut changed) = changed_columns(tx, "github_repositories", "id") else {
        return false;
    };
    changed.sort();
    changed == ["ping", "updated"]
}

/// A user row refresh paired with a remote-token refresh
pub fn matches_oauth_relogin(tx: &Tx) -> bool {
    shape_eq(
        &tx.ops_tuples(&[]),
        &[
            ("accounts_user", Update),
            ("oauthclient_remotetoken", Update),
        ],
    )
}

/// DataCite flipping one or two of our DOIs to registered status
pub fn matches_doi_registration(tx: &Tx) -> bool {
    let ops = tx.ops_tuples(&[]);
    let new_version: &[(&str, OperationKind)] = &[("pidstore_pid", Update)];
    let first_publish: &[(&str, OperationKind)] =
        &[("pidstore_pid", Update), ("pidstore_pid", Update)];
    if !shape_eq(&ops, new_version) && !shape_eq(&ops, first_publish) {
        return false;
    }
    let pids = tx.rows_grouped_by(
        "pidstore_pid",
        &["pid_type", "pid_value"],
        WRITE_KINDS,
        false,
    );
    !pids.is_empty()
        && pids.iter().all(|pid| {
            pid.get_str("pid_type") == Some("doi")
                && pid
                    .get_str("pid_value")
                    .map(|value| DATACITE_PREFIXES.iter().any(|prefix| value.starts_with(prefix)))
                    .unwrap_or(false)
                && pid.get_str("status") == Some("R")
        })
}

/// Celery OAI-set maintenance: every operation is a record update and more
/// than two distinct records are touched (one transaction can legitimately
/// carry one draft plus one record change, never more)
pub fn matches_multi_record_noop(tx: &Tx) -> bool {
    let updates = tx.filtered_tuples(&["records_metadata"], &[Update]);
    if updates.len() != tx.operations.len() {
        return false;
    }
    tx.distinct_keys("records_metadata", &[Update]) > 2
}

/// A single bucket update that changes nothing the target cares about
pub fn matches_bucket_noop(tx: &Tx) -> bool {
    shape_eq(&tx.ops_tuples(&[]), &[("files_bucket", Update)])
}

pub fn transform_file_checksum(_tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::Ignored(ActionKind::FileChecksum))
}

pub fn transform_user_session(_tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::Ignored(ActionKind::UserSession))
}

pub fn transform_github_sync(_tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::Ignored(ActionKind::GitHubSync))
}

pub fn transform_github_ping(_tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::Ignored(ActionKind::GitHubPing))
}

pub fn transform_oauth_relogin(_tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::Ignored(ActionKind::OAuthReLogin))
}

pub fn transform_doi_registration(_tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::Ignored(ActionKind::DoiRegistration))
}

pub fn transform_multi_record_noop(_tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::Ignored(ActionKind::MultiRecordNoop))
}

pub fn transform_bucket_noop(_tx: &Tx) -> Result<ActionPayload> {
    Ok(ActionPayload::Ignored(ActionKind::BucketNoop))
}
