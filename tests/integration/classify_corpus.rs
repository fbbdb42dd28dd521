//! Classification scenarios: totality over the action corpus, and the
//! shape-collision cases where content predicates decide between the
//! regular and the media file actions.

use tributary::actions::{classify, route, ActionKind};
use tributary::events::Tx;
use tributary::extract::{LogExtractor, MemoryConsumer};

use crate::common::fixtures as fx;

async fn extract_all(ops: Vec<serde_json::Value>, tx_info: Vec<serde_json::Value>) -> Vec<Tx> {
    let mut extractor = LogExtractor::new(
        MemoryConsumer::single(fx::to_records(&ops)),
        MemoryConsumer::single(fx::to_records(&tx_info)),
        0,
        0,
    )
    .with_slack(0);
    let mut result = Vec::new();
    while let Some(tx) = extractor.next_tx().await.expect("extract") {
        result.push(tx);
    }
    result
}

/// Every transaction in the corpus classifies to exactly one registered
/// action, ignored actions included
pub async fn test_classification_totality() {
    let corpus = fx::action_corpus();
    let txs = extract_all(corpus.ops, corpus.tx_info).await;
    assert_eq!(txs.len(), corpus.expected.len());

    for (tx, (xid, expected_name)) in txs.iter().zip(&corpus.expected) {
        assert_eq!(tx.xid, *xid);
        let kind = classify(tx)
            .unwrap_or_else(|| panic!("xid {} did not classify", tx.xid));
        assert_eq!(kind.name(), *expected_name, "xid {}", tx.xid);
        // the transform half must hold up too
        let routed = route(tx).expect("transform");
        assert_eq!(routed.kind, kind);
    }
}

/// A plain upload shape with an ordinary key routes to FileUpload; the
/// identical shape carrying the reserved media MIME does not
pub async fn test_file_upload_key_collision() {
    let plain = fx::upload_ops(1, 100, fx::BUCKET, "data.txt", false);
    let txs = extract_all(plain, vec![fx::boundary_line(1, 1_000, 6)]).await;
    assert_eq!(classify(&txs[0]), Some(ActionKind::FileUpload));

    let media_key = fx::upload_ops(2, 100, fx::BUCKET, fx::RESERVED_MEDIA_KEY, false);
    let txs = extract_all(media_key, vec![fx::boundary_line(2, 1_000, 6)]).await;
    assert_ne!(classify(&txs[0]), Some(ActionKind::FileUpload));
}

/// The token-prefixed shape with the reserved MIME is a media-file upload
pub async fn test_media_file_upload_fingerprint() {
    let ops = fx::upload_ops(3, 100, fx::MEDIA_BUCKET, fx::RESERVED_MEDIA_KEY, true);
    let txs = extract_all(ops, vec![fx::boundary_line(3, 1_000, 7)]).await;
    assert_eq!(classify(&txs[0]), Some(ActionKind::MediaFileUpload));
}
