//! Fixture corpus builders for the integration suite
//!
//! The captured production topic sample is not redistributable, so the
//! extract scenarios run against a synthetic corpus that reproduces its
//! structural features: interleaved multi-table transactions, a boundary
//! below the resume checkpoint, an operation set from a transaction older
//! than the oldest active xid, and a final wide "publish" transaction
//! spanning nine tables. The action corpus is a second, fully classifiable
//! set covering every registered action.
//!
//! Shuffling and chunking use a seeded xorshift so runs are deterministic
//! without pulling in an RNG dependency.

use serde_json::{json, Value};
use std::io::Write;
use std::path::Path;

use tributary::events::LogRecord;

pub const BASE_XID: u64 = 563_388_700;
pub const BASE_LSN: u64 = 1_461_029_000_000;

/// Number of transactions in the extract corpus
pub const EXTRACT_TX_COUNT: usize = 30;

/// The transaction whose xid predates the oldest active transaction
pub const OLD_XID: u64 = BASE_XID - 50;
pub const OLD_XID_INDEX: usize = 3;

/// Resume filters for the primary scenario: three transactions fall at or
/// below the checkpoint, one more is suppressed by xid
pub const LAST_COMMIT_LSN: u64 = BASE_LSN + 2_000;
pub const OLDEST_ACTIVE_XID: u64 = BASE_XID;

/// A later checkpoint that additionally excludes transactions 3..=9
pub const LATER_COMMIT_LSN: u64 = BASE_LSN + 9_000;

pub fn corpus_xid(index: usize) -> u64 {
    if index == OLD_XID_INDEX {
        OLD_XID
    } else {
        BASE_XID + index as u64 * 10
    }
}

pub fn corpus_commit_lsn(index: usize) -> u64 {
    BASE_LSN + index as u64 * 1_000
}

/// One ops-topic line in the decoded envelope layout
pub fn op_line(
    table: &str,
    op: &str,
    xid: u64,
    lsn: u64,
    key: Value,
    before: Value,
    after: Value,
) -> Value {
    json!({
        "key": key,
        "value": {
            "op": op,
            "before": before,
            "after": after,
            "source": {"schema": "public", "table": table, "txId": xid, "lsn": lsn},
        },
    })
}

/// One boundary-topic line
pub fn boundary_line(xid: u64, commit_lsn: u64, event_count: usize) -> Value {
    json!({
        "key": {"id": format!("{xid}:{commit_lsn}")},
        "value": {
            "status": "END",
            "id": format!("{xid}:{commit_lsn}"),
            "event_count": event_count,
        },
    })
}

pub fn to_records(lines: &[Value]) -> Vec<LogRecord> {
    lines
        .iter()
        .map(|line| LogRecord::from_line(&line.to_string()).expect("fixture line parses"))
        .collect()
}

pub fn write_jsonl(path: &Path, lines: &[Value]) {
    let mut file = std::fs::File::create(path).expect("create fixture file");
    for line in lines {
        writeln!(file, "{line}").expect("write fixture line");
    }
}

// ===== Deterministic shuffling =====

pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// Fisher-Yates with a seeded xorshift
pub fn shuffle<T>(items: &mut [T], seed: u64) {
    let mut rng = XorShift::new(seed);
    for i in (1..items.len()).rev() {
        let j = (rng.next() % (i as u64 + 1)) as usize;
        items.swap(i, j);
    }
}

/// Split into random-sized chunks (1..=max_chunk), preserving order
pub fn random_chunks<T: Clone>(items: &[T], seed: u64, max_chunk: usize) -> Vec<Vec<T>> {
    let mut rng = XorShift::new(seed);
    let mut chunks = Vec::new();
    let mut index = 0;
    while index < items.len() {
        let size = (rng.next() as usize % max_chunk) + 1;
        let end = (index + size).min(items.len());
        chunks.push(items[index..end].to_vec());
        index = end;
    }
    chunks
}

// ===== Extract corpus =====

pub struct ExtractCorpus {
    pub ops: Vec<Value>,
    pub tx_info: Vec<Value>,
}

/// Per-table op counts of the final wide transaction, in the shape the
/// publish flow produces on the source
pub fn publish_tx_table_counts() -> Vec<(&'static str, usize)> {
    vec![
        ("pidstore_pid", 8),
        ("files_bucket", 5),
        ("records_metadata", 3),
        ("files_files", 2),
        ("files_object", 2),
        ("records_buckets", 1),
        ("communities_community_record", 1),
        ("pidstore_redirect", 1),
        ("pidrelations_pidrelation", 1),
    ]
}

fn publish_tx_ops(xid: u64, base_lsn: u64) -> Vec<Value> {
    let mut ops = Vec::new();
    let mut lsn = base_lsn;
    let mut push = |table: &str, op: &str, key: Value, before: Value, after: Value, lsn: &mut u64| {
        ops.push(op_line(table, op, xid, *lsn, key, before, after));
        *lsn += 10;
    };

    for i in 0..8 {
        push(
            "pidstore_pid",
            "u",
            json!({"id": 9000 + i}),
            json!({"id": 9000 + i, "pid_type": "doi", "pid_value": format!("10.5281/rdm.{}", 700000 + i), "status": "K"}),
            json!({"id": 9000 + i, "pid_type": "doi", "pid_value": format!("10.5281/rdm.{}", 700000 + i), "status": "R"}),
            &mut lsn,
        );
    }
    for i in 0..5 {
        let bucket = format!("0e12b4b6-9cc7-46df-9a04-c11c478de2{:02}", 10 + i);
        push(
            "files_bucket",
            "u",
            json!({"id": bucket}),
            json!({"id": bucket, "size": 0, "locked": false}),
            json!({"id": bucket, "size": 1024, "locked": true}),
            &mut lsn,
        );
    }
    for i in 0..3 {
        let record = format!("d94f793c-47d2-48e2-9867-ca597b4ebb{:02}", 40 + i);
        push(
            "records_metadata",
            "u",
            json!({"id": record}),
            json!({"id": record, "json": {"id": "700000"}, "version_id": 1}),
            json!({"id": record, "json": {"id": "700000", "published": true}, "version_id": 2}),
            &mut lsn,
        );
    }
    for i in 0..2 {
        let file = format!("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeee{:02}", 10 + i);
        push(
            "files_files",
            "u",
            json!({"id": file}),
            json!({"id": file, "checksum": "md5:abc"}),
            json!({"id": file, "checksum": "md5:abc", "last_check": true}),
            &mut lsn,
        );
    }
    for i in 0..2 {
        let version = format!("11111111-2222-3333-4444-5555555555{:02}", 10 + i);
        push(
            "files_object",
            "u",
            json!({"version_id": version}),
            json!({"version_id": version, "key": "data.txt", "is_head": true}),
            json!({"version_id": version, "key": "data.txt", "is_head": false}),
            &mut lsn,
        );
    }
    for table in [
        "records_buckets",
        "communities_community_record",
        "pidstore_redirect",
        "pidrelations_pidrelation",
    ] {
        push(
            table,
            "c",
            json!({"id": 1}),
            Value::Null,
            json!({"id": 1, "created": "2023-06-01T10:00:00"}),
            &mut lsn,
        );
    }
    ops
}

/// Build the extract corpus in natural (commit) order. Transactions are
/// generic multi-op writes on auxiliary tables, except the last one, which
/// is the wide publish transaction.
pub fn extract_corpus() -> ExtractCorpus {
    let mut ops = Vec::new();
    let mut tx_info = Vec::new();
    for index in 0..EXTRACT_TX_COUNT {
        let xid = corpus_xid(index);
        let commit_lsn = corpus_commit_lsn(index);
        let base_lsn = commit_lsn - 900;
        let tx_ops: Vec<Value> = if index == EXTRACT_TX_COUNT - 1 {
            publish_tx_ops(xid, base_lsn)
        } else {
            let count = 1 + index % 4;
            (0..count)
                .map(|j| {
                    op_line(
                        &format!("aux_table_{}", index % 5),
                        "u",
                        xid,
                        base_lsn + j as u64 * 10,
                        json!({"id": j}),
                        json!({"id": j, "value": index}),
                        json!({"id": j, "value": index + 1}),
                    )
                })
                .collect()
        };
        tx_info.push(boundary_line(xid, commit_lsn, tx_ops.len()));
        ops.extend(tx_ops);
    }
    ExtractCorpus { ops, tx_info }
}

/// Expected emissions for a checkpoint: every transaction above the
/// checkpoint whose xid is not suppressed, in commit order
pub fn expected_xids(last_commit_lsn: u64) -> Vec<u64> {
    (0..EXTRACT_TX_COUNT)
        .filter(|&index| {
            corpus_commit_lsn(index) > last_commit_lsn && corpus_xid(index) >= OLDEST_ACTIVE_XID
        })
        .map(corpus_xid)
        .collect()
}

// ===== Action corpus =====

pub const BUCKET: &str = "0e12b4b6-9cc7-46df-9a04-c11c478de211";
pub const MEDIA_BUCKET: &str = "3f8f7a10-55aa-44bb-88cc-11dd22ee33ff";
pub const DRAFT: &str = "d94f793c-47d2-48e2-9867-ca597b4ebb41";
pub const DRAFT_ROW: &str = "7b16bbc0-3e24-4f1e-9c44-6d7f8e9a0b1c";
pub const OBJECT_VERSION: &str = "11111111-2222-3333-4444-555555555555";
pub const FILE_INSTANCE: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
pub const RESERVED_MEDIA_KEY: &str = "application/vnd.plazi.v1+xml";

fn token_update(xid: u64, lsn: u64) -> Value {
    op_line(
        "oauth2server_token",
        "u",
        xid,
        lsn,
        json!({"id": 9}),
        json!({"id": 9, "last_used": 1685613600000000u64}),
        json!({"id": 9, "last_used": 1685613660000000u64}),
    )
}

/// The six-op add-file transaction; `bucket`/`key` select the regular or
/// media flavor
pub fn upload_ops(xid: u64, base_lsn: u64, bucket: &str, key: &str, with_token: bool) -> Vec<Value> {
    let mut ops = Vec::new();
    let mut lsn = base_lsn;
    if with_token {
        ops.push(token_update(xid, lsn));
        lsn += 10;
    }
    ops.push(op_line(
        "files_bucket",
        "u",
        xid,
        lsn,
        json!({"id": bucket}),
        json!({"id": bucket, "size": 0, "locked": false}),
        json!({"id": bucket, "size": 0, "locked": true}),
    ));
    lsn += 10;
    ops.push(op_line(
        "files_object",
        "c",
        xid,
        lsn,
        json!({"version_id": OBJECT_VERSION}),
        Value::Null,
        json!({"version_id": OBJECT_VERSION, "bucket_id": bucket, "key": key, "file_id": null, "is_head": true, "created": "2023-06-01T10:00:00", "updated": "2023-06-01T10:00:00"}),
    ));
    lsn += 10;
    ops.push(op_line(
        "files_files",
        "c",
        xid,
        lsn,
        json!({"id": FILE_INSTANCE}),
        Value::Null,
        json!({"id": FILE_INSTANCE, "uri": null, "size": null, "checksum": null}),
    ));
    lsn += 10;
    ops.push(op_line(
        "files_object",
        "u",
        xid,
        lsn,
        json!({"version_id": OBJECT_VERSION}),
        json!({"version_id": OBJECT_VERSION, "bucket_id": bucket, "key": key, "file_id": null, "is_head": true}),
        json!({"version_id": OBJECT_VERSION, "bucket_id": bucket, "key": key, "file_id": FILE_INSTANCE, "is_head": true}),
    ));
    lsn += 10;
    ops.push(op_line(
        "files_files",
        "u",
        xid,
        lsn,
        json!({"id": FILE_INSTANCE}),
        json!({"id": FILE_INSTANCE, "uri": null, "size": null, "checksum": null}),
        json!({"id": FILE_INSTANCE, "uri": "root://eos/z/1", "size": 1024, "checksum": "md5:abc"}),
    ));
    lsn += 10;
    ops.push(op_line(
        "files_bucket",
        "u",
        xid,
        lsn,
        json!({"id": bucket}),
        json!({"id": bucket, "size": 0, "locked": true}),
        json!({"id": bucket, "size": 1024, "locked": false}),
    ));
    ops
}

pub fn hard_delete_ops(
    xid: u64,
    base_lsn: u64,
    bucket: &str,
    key: &str,
    with_token: bool,
) -> Vec<Value> {
    let mut ops = Vec::new();
    let mut lsn = base_lsn;
    if with_token {
        ops.push(token_update(xid, lsn));
        lsn += 10;
    }
    ops.push(op_line(
        "files_bucket",
        "u",
        xid,
        lsn,
        json!({"id": bucket}),
        json!({"id": bucket, "size": 1024}),
        json!({"id": bucket, "size": 0}),
    ));
    lsn += 10;
    ops.push(op_line(
        "files_object",
        "d",
        xid,
        lsn,
        json!({"version_id": OBJECT_VERSION}),
        json!({"version_id": OBJECT_VERSION, "bucket_id": bucket, "key": key, "file_id": FILE_INSTANCE, "is_head": true}),
        Value::Null,
    ));
    ops
}

pub fn soft_delete_ops(xid: u64, base_lsn: u64, bucket: &str, key: &str) -> Vec<Value> {
    let marker = "22222222-3333-4444-5555-666666666666";
    vec![
        op_line(
            "files_bucket",
            "u",
            xid,
            base_lsn,
            json!({"id": bucket}),
            json!({"id": bucket, "size": 1024}),
            json!({"id": bucket, "size": 0}),
        ),
        op_line(
            "files_object",
            "u",
            xid,
            base_lsn + 10,
            json!({"version_id": OBJECT_VERSION}),
            json!({"version_id": OBJECT_VERSION, "bucket_id": bucket, "key": key, "file_id": FILE_INSTANCE, "is_head": true}),
            json!({"version_id": OBJECT_VERSION, "bucket_id": bucket, "key": key, "file_id": FILE_INSTANCE, "is_head": false}),
        ),
        op_line(
            "files_object",
            "c",
            xid,
            base_lsn + 20,
            json!({"version_id": marker}),
            Value::Null,
            json!({"version_id": marker, "bucket_id": bucket, "key": key, "file_id": null, "is_head": true}),
        ),
    ]
}

pub fn draft_edit_ops(xid: u64, lsn: u64) -> Vec<Value> {
    vec![op_line(
        "records_metadata",
        "u",
        xid,
        lsn,
        json!({"id": DRAFT_ROW}),
        json!({"id": DRAFT_ROW, "json": {"id": "123456", "metadata": {"title": "Old"}}, "version_id": 3}),
        json!({"id": DRAFT_ROW, "json": {"id": "123456", "metadata": {"title": "New"}}, "version_id": 4}),
    )]
}

pub fn checksum_ops(xid: u64, lsn: u64) -> Vec<Value> {
    vec![op_line(
        "files_files",
        "u",
        xid,
        lsn,
        json!({"id": FILE_INSTANCE}),
        json!({"id": FILE_INSTANCE, "checksum": "md5:abc", "last_check": false, "last_check_at": "2023-05-01T00:00:00", "updated": "2023-05-01T00:00:00"}),
        json!({"id": FILE_INSTANCE, "checksum": "md5:abc", "last_check": true, "last_check_at": "2023-06-01T00:00:00", "updated": "2023-06-01T00:00:00"}),
    )]
}

pub fn user_session_ops(xid: u64, base_lsn: u64) -> Vec<Value> {
    vec![
        op_line(
            "accounts_user",
            "u",
            xid,
            base_lsn,
            json!({"id": 3}),
            json!({"id": 3, "active": true, "login_count": 7}),
            json!({"id": 3, "active": true, "login_count": 8}),
        ),
        op_line(
            "accounts_user_session_activity",
            "c",
            xid,
            base_lsn + 10,
            json!({"sid_s": "s1"}),
            Value::Null,
            json!({"sid_s": "s1", "user_id": 3}),
        ),
        op_line(
            "accounts_user_session_activity",
            "u",
            xid,
            base_lsn + 20,
            json!({"sid_s": "s2"}),
            json!({"sid_s": "s2", "user_id": 3, "updated": "2023-05-01T00:00:00"}),
            json!({"sid_s": "s2", "user_id": 3, "updated": "2023-06-01T00:00:00"}),
        ),
    ]
}

pub fn github_sync_ops(xid: u64, base_lsn: u64) -> Vec<Value> {
    let repo = "12121212-3434-5656-7878-909090909090";
    vec![
        op_line(
            "oauthclient_remoteaccount",
            "u",
            xid,
            base_lsn,
            json!({"id": 11}),
            json!({"id": 11, "extra_data": {"last_sync": "a"}}),
            json!({"id": 11, "extra_data": {"last_sync": "b"}}),
        ),
        op_line(
            "github_repositories",
            "u",
            xid,
            base_lsn + 10,
            json!({"id": repo}),
            json!({"id": repo, "hook": 1}),
            json!({"id": repo, "hook": 2}),
        ),
    ]
}

pub fn github_ping_ops(xid: u64, lsn: u64) -> Vec<Value> {
    let repo = "12121212-3434-5656-7878-909090909090";
    vec![op_line(
        "github_repositories",
        "u",
        xid,
        lsn,
        json!({"id": repo}),
        json!({"id": repo, "ping": "2023-05-01T00:00:00", "updated": "2023-05-01T00:00:00"}),
        json!({"id": repo, "ping": "2023-06-01T00:00:00", "updated": "2023-06-01T00:00:00"}),
    )]
}

pub fn oauth_relogin_ops(xid: u64, base_lsn: u64) -> Vec<Value> {
    vec![
        op_line(
            "accounts_user",
            "u",
            xid,
            base_lsn,
            json!({"id": 3}),
            json!({"id": 3, "login_count": 8}),
            json!({"id": 3, "login_count": 9}),
        ),
        op_line(
            "oauthclient_remotetoken",
            "u",
            xid,
            base_lsn + 10,
            json!({"id_remote_account": 11}),
            json!({"id_remote_account": 11, "access_token": "old"}),
            json!({"id_remote_account": 11, "access_token": "new"}),
        ),
    ]
}

pub fn doi_registration_ops(xid: u64, base_lsn: u64, count: usize) -> Vec<Value> {
    (0..count)
        .map(|i| {
            op_line(
                "pidstore_pid",
                "u",
                xid,
                base_lsn + i as u64 * 10,
                json!({"id": 500 + i}),
                json!({"id": 500 + i, "pid_type": "doi", "pid_value": format!("10.5281/rdm.12345{i}"), "status": "K"}),
                json!({"id": 500 + i, "pid_type": "doi", "pid_value": format!("10.5281/rdm.12345{i}"), "status": "R"}),
            )
        })
        .collect()
}

pub fn multi_record_noop_ops(xid: u64, base_lsn: u64) -> Vec<Value> {
    (0..3)
        .map(|i| {
            let record = format!("d94f793c-47d2-48e2-9867-ca597b4ebb{:02}", 50 + i);
            op_line(
                "records_metadata",
                "u",
                xid,
                base_lsn + i as u64 * 10,
                json!({"id": record}),
                json!({"id": record, "updated": "2023-05-01T00:00:00"}),
                json!({"id": record, "updated": "2023-06-01T00:00:00"}),
            )
        })
        .collect()
}

pub fn bucket_noop_ops(xid: u64, lsn: u64) -> Vec<Value> {
    vec![op_line(
        "files_bucket",
        "u",
        xid,
        lsn,
        json!({"id": BUCKET}),
        json!({"id": BUCKET, "updated": "2023-05-01T00:00:00"}),
        json!({"id": BUCKET, "updated": "2023-06-01T00:00:00"}),
    )]
}

pub struct ActionCorpus {
    pub ops: Vec<Value>,
    pub tx_info: Vec<Value>,
    /// (xid, expected action name) in commit order
    pub expected: Vec<(u64, &'static str)>,
}

/// A transaction per registered action, in commit order
pub fn action_corpus() -> ActionCorpus {
    let mut ops = Vec::new();
    let mut tx_info = Vec::new();
    let mut expected = Vec::new();
    let mut add = |index: u64, name: &'static str, tx_ops: Vec<Value>| {
        let xid = BASE_XID + 1_000 + index;
        let commit_lsn = BASE_LSN + 100_000 + index * 1_000;
        tx_info.push(boundary_line(xid, commit_lsn, tx_ops.len()));
        ops.extend(tx_ops);
        expected.push((xid, name));
    };

    let lsn = |index: u64| BASE_LSN + 100_000 + index * 1_000 - 900;

    add(0, "file-upload", upload_ops(BASE_XID + 1_000, lsn(0), BUCKET, "data.txt", false));
    add(
        1,
        "file-upload",
        upload_ops(BASE_XID + 1_001, lsn(1), BUCKET, "data.txt", true),
    );
    add(
        2,
        "media-file-upload",
        upload_ops(BASE_XID + 1_002, lsn(2), MEDIA_BUCKET, RESERVED_MEDIA_KEY, true),
    );
    add(
        3,
        "file-delete",
        hard_delete_ops(BASE_XID + 1_003, lsn(3), BUCKET, "data.txt", false),
    );
    add(
        4,
        "file-delete",
        soft_delete_ops(BASE_XID + 1_004, lsn(4), BUCKET, "data.txt"),
    );
    add(
        5,
        "media-file-delete",
        hard_delete_ops(BASE_XID + 1_005, lsn(5), MEDIA_BUCKET, RESERVED_MEDIA_KEY, true),
    );
    add(6, "draft-edit", draft_edit_ops(BASE_XID + 1_006, lsn(6)));
    add(7, "file-checksum", checksum_ops(BASE_XID + 1_007, lsn(7)));
    add(8, "user-session", user_session_ops(BASE_XID + 1_008, lsn(8)));
    add(9, "gh-sync", github_sync_ops(BASE_XID + 1_009, lsn(9)));
    add(10, "gh-ping", github_ping_ops(BASE_XID + 1_010, lsn(10)));
    add(
        11,
        "oauth-relogin",
        oauth_relogin_ops(BASE_XID + 1_011, lsn(11)),
    );
    add(
        12,
        "doi-registration",
        doi_registration_ops(BASE_XID + 1_012, lsn(12), 1),
    );
    add(
        13,
        "doi-registration",
        doi_registration_ops(BASE_XID + 1_013, lsn(13), 2),
    );
    add(
        14,
        "multi-record-noop-updates",
        multi_record_noop_ops(BASE_XID + 1_014, lsn(14)),
    );
    add(15, "bucket-noop", bucket_noop_ops(BASE_XID + 1_015, lsn(15)));

    ActionCorpus {
        ops,
        tx_info,
        expected,
    }
}
