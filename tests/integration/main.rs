// tests/integration/main.rs
//
// Integration test suite entry point
// All integration tests are compiled as a single binary to avoid dead code warnings

// Import common utilities once for all integration tests
#[path = "../common/mod.rs"]
mod common;

// Import all integration test modules
mod classify_corpus;
mod extract_stream;
mod replay;

// Re-export test functions with #[test] attribute
#[tokio::test]
async fn test_extract_corpus_shape() {
    extract_stream::test_extract_corpus_shape().await;
}

#[tokio::test]
async fn test_simple_extract() {
    extract_stream::test_simple_extract().await;
}

#[tokio::test]
async fn test_randomized_extract() {
    extract_stream::test_randomized_extract().await;
}

#[tokio::test]
async fn test_random_sized_batches_extract() {
    extract_stream::test_random_sized_batches_extract().await;
}

#[tokio::test]
async fn test_later_checkpoint() {
    extract_stream::test_later_checkpoint().await;
}

#[tokio::test]
async fn test_classification_totality() {
    classify_corpus::test_classification_totality().await;
}

#[tokio::test]
async fn test_file_upload_key_collision() {
    classify_corpus::test_file_upload_key_collision().await;
}

#[tokio::test]
async fn test_media_file_upload_fingerprint() {
    classify_corpus::test_media_file_upload_fingerprint().await;
}

#[tokio::test]
async fn test_dry_run_replay_full_corpus() {
    replay::test_dry_run_replay_full_corpus().await;
}

#[tokio::test]
async fn test_resume_idempotence() {
    replay::test_resume_idempotence().await;
}

#[tokio::test]
async fn test_atomicity_of_state_scope() {
    replay::test_atomicity_of_state_scope().await;
}
