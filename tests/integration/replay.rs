//! End-to-end dry-run replay over topic dump files, resume idempotence,
//! and transactional atomicity of the state scope.

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;

use tributary::actions::files::{FileRecord, FileUploadPayload, MediaFileUploadPayload};
use tributary::actions::{ActionPayload, ActionKind};
use tributary::config::Config;
use tributary::events::RowImage;
use tributary::extract::{JsonlConsumer, LogExtractor};
use tributary::load::loader_for;
use tributary::pipeline::{Driver, PipelineReport};
use tributary::state::StateStore;

use crate::common::fixtures as fx;

fn seeded_state() -> StateStore {
    let state = StateStore::in_memory().expect("state store");
    state
        .insert("buckets", fx::BUCKET, json!({"draft_id": fx::DRAFT}))
        .unwrap();
    state
        .insert("buckets", fx::MEDIA_BUCKET, json!({"draft_id": fx::DRAFT}))
        .unwrap();
    state
        .insert("drafts", fx::DRAFT_ROW, json!({"draft_id": fx::DRAFT}))
        .unwrap();
    state
        .insert("pids", "123456", json!({"record_id": fx::DRAFT}))
        .unwrap();
    state
}

async fn dry_run(dir: &TempDir) -> PipelineReport {
    let corpus = fx::action_corpus();
    let ops_path = dir.path().join("ops.jsonl");
    let tx_path = dir.path().join("tx.jsonl");
    fx::write_jsonl(&ops_path, &corpus.ops);
    fx::write_jsonl(&tx_path, &corpus.tx_info);

    let extractor = LogExtractor::new(
        JsonlConsumer::open(&ops_path).expect("ops consumer"),
        JsonlConsumer::open(&tx_path).expect("tx consumer"),
        0,
        0,
    )
    .with_slack(10);

    let mut config = Config::default();
    config.pipeline.poison_dir = dir
        .path()
        .join("poison")
        .to_string_lossy()
        .to_string();

    let (_cancel, shutdown) = watch::channel(false);
    let mut driver = Driver::new(extractor, None, seeded_state(), &config, shutdown);
    driver.run().await.expect("pipeline run")
}

/// The full action corpus replays dry without a halt: seven substantive
/// actions, nine ignored
pub async fn test_dry_run_replay_full_corpus() {
    let dir = TempDir::new().unwrap();
    let report = dry_run(&dir).await;
    assert_eq!(report.processed, 16);
    assert_eq!(report.applied, 7);
    assert_eq!(report.ignored, 9);
    assert_eq!(report.skipped, 0);
}

/// Replaying the same input from the same checkpoint twice produces the
/// same outcome
pub async fn test_resume_idempotence() {
    let dir = TempDir::new().unwrap();
    let first = dry_run(&dir).await;
    let second = dry_run(&dir).await;
    assert_eq!(first, second);
}

fn media_upload_payload() -> ActionPayload {
    let image = |value: serde_json::Value| match value {
        serde_json::Value::Object(map) => RowImage(map),
        _ => panic!("expected object"),
    };
    ActionPayload::MediaFileUpload(MediaFileUploadPayload {
        upload: FileUploadPayload {
            bucket: image(json!({"id": fx::MEDIA_BUCKET, "size": 1024})),
            object_version: image(json!({
                "version_id": fx::OBJECT_VERSION,
                "bucket_id": fx::MEDIA_BUCKET,
                "key": fx::RESERVED_MEDIA_KEY,
                "is_head": true,
            })),
            replaced_object_version: None,
            file_instance: image(json!({"size": 1024, "checksum": "md5:abc"})),
            file_record: FileRecord {
                created: None,
                updated: None,
                version_id: 1,
                key: fx::RESERVED_MEDIA_KEY.to_string(),
                object_version_id: fx::OBJECT_VERSION.to_string(),
            },
        },
        pid_value: Some("123456".to_string()),
    })
}

/// A crash between payload preparation and target commit leaves the state
/// store untouched; committing the scope publishes exactly the buffered
/// writes
pub async fn test_atomicity_of_state_scope() {
    let state = StateStore::in_memory().expect("state store");
    state
        .insert("pids", "123456", json!({"record_id": fx::DRAFT}))
        .unwrap();
    let loader = loader_for(ActionKind::MediaFileUpload);
    let payload = media_upload_payload();

    // simulated crash: prepare succeeds, the scope is dropped uncommitted
    {
        let mut scope = state.begin_scope();
        let statements = loader.prepare(&payload, &mut scope).expect("prepare");
        assert!(!statements.is_empty());
        assert!(scope.get("buckets", fx::MEDIA_BUCKET).unwrap().is_some());
    }
    assert!(state.get("buckets", fx::MEDIA_BUCKET).unwrap().is_none());

    // the commit path publishes the bucket→draft link
    let mut scope = state.begin_scope();
    loader.prepare(&payload, &mut scope).expect("prepare");
    state.commit_scope(scope).expect("commit scope");
    let entry = state.get("buckets", fx::MEDIA_BUCKET).unwrap().unwrap();
    assert_eq!(
        entry.get("draft_id").and_then(serde_json::Value::as_str),
        Some(fx::DRAFT)
    );
}
