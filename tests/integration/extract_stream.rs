//! Extract-stage scenarios over the synthetic fixture corpus: a clean
//! uninterrupted pass, fully shuffled intake, random-sized batches, and a
//! later resume checkpoint. Shuffled and batched runs must produce output
//! identical to the clean pass.

use tributary::events::Tx;
use tributary::extract::{LogExtractor, MemoryConsumer};

use crate::common::fixtures as fx;

/// Everything that identifies an emission, for bitwise comparison between runs
type Fingerprint = Vec<(u64, u64, Vec<(String, u64)>)>;

fn fingerprint(result: &[Tx]) -> Fingerprint {
    result
        .iter()
        .map(|tx| {
            (
                tx.xid,
                tx.commit_lsn,
                tx.operations
                    .iter()
                    .map(|op| (op.source_table.clone(), op.lsn))
                    .collect(),
            )
        })
        .collect()
}

async fn run_extract(
    ops_batches: Vec<Vec<tributary::events::LogRecord>>,
    tx_batches: Vec<Vec<tributary::events::LogRecord>>,
    last_commit_lsn: u64,
    slack: usize,
) -> Vec<Tx> {
    let mut extractor = LogExtractor::new(
        MemoryConsumer::new(ops_batches),
        MemoryConsumer::new(tx_batches),
        last_commit_lsn,
        fx::OLDEST_ACTIVE_XID,
    )
    .with_slack(slack);
    let mut result = Vec::new();
    while let Some(tx) = extractor.next_tx().await.expect("extract") {
        result.push(tx);
    }
    result
}

fn assert_result(result: &[Tx], last_commit_lsn: u64) {
    let expected = fx::expected_xids(last_commit_lsn);
    let emitted: Vec<u64> = result.iter().map(|tx| tx.xid).collect();
    assert_eq!(emitted, expected);

    // strictly increasing commit order, strictly increasing op lsns inside
    for pair in result.windows(2) {
        assert!(pair[0].commit_lsn < pair[1].commit_lsn);
    }
    for tx in result {
        for pair in tx.operations.windows(2) {
            assert!(pair[0].lsn < pair[1].lsn);
        }
        for op in &tx.operations {
            assert_eq!(op.commit_lsn, Some(tx.commit_lsn));
        }
    }

    // the suppressed and pre-checkpoint transactions never surface
    assert!(!emitted.contains(&fx::OLD_XID));
    assert!(!emitted.contains(&fx::corpus_xid(0)));

    // the final publish transaction arrives whole
    let last = result.last().expect("publish tx emitted");
    assert_eq!(last.xid, fx::corpus_xid(fx::EXTRACT_TX_COUNT - 1));
    for (table, count) in fx::publish_tx_table_counts() {
        let observed = last
            .operations
            .iter()
            .filter(|op| op.source_table == table)
            .count();
        assert_eq!(observed, count, "op count for {table}");
    }
}

pub async fn test_extract_corpus_shape() {
    let corpus = fx::extract_corpus();
    assert_eq!(corpus.tx_info.len(), fx::EXTRACT_TX_COUNT);
    // 29 generic transactions with 1..=4 ops plus the 24-op publish
    let publish_ops: usize = fx::publish_tx_table_counts().iter().map(|(_, n)| n).sum();
    assert_eq!(publish_ops, 24);
    assert!(corpus.ops.len() > fx::EXTRACT_TX_COUNT);
}

pub async fn test_simple_extract() {
    let corpus = fx::extract_corpus();
    let result = run_extract(
        vec![fx::to_records(&corpus.ops)],
        vec![fx::to_records(&corpus.tx_info)],
        fx::LAST_COMMIT_LSN,
        10,
    )
    .await;
    assert_result(&result, fx::LAST_COMMIT_LSN);
}

pub async fn test_randomized_extract() {
    let corpus = fx::extract_corpus();
    let baseline = run_extract(
        vec![fx::to_records(&corpus.ops)],
        vec![fx::to_records(&corpus.tx_info)],
        fx::LAST_COMMIT_LSN,
        10,
    )
    .await;

    // a single fully shuffled batch per stream: within one run the output
    // order must not depend on arrival order at all
    for seed in [7, 99, 4242] {
        let mut ops = fx::to_records(&corpus.ops);
        let mut tx_info = fx::to_records(&corpus.tx_info);
        fx::shuffle(&mut ops, seed);
        fx::shuffle(&mut tx_info, seed.wrapping_mul(31));
        let shuffled = run_extract(vec![ops], vec![tx_info], fx::LAST_COMMIT_LSN, 10).await;
        assert_result(&shuffled, fx::LAST_COMMIT_LSN);
        assert_eq!(fingerprint(&shuffled), fingerprint(&baseline));
    }
}

pub async fn test_random_sized_batches_extract() {
    let corpus = fx::extract_corpus();
    let baseline = run_extract(
        vec![fx::to_records(&corpus.ops)],
        vec![fx::to_records(&corpus.tx_info)],
        fx::LAST_COMMIT_LSN,
        10,
    )
    .await;

    for seed in [3, 1234] {
        let ops_batches = fx::random_chunks(&fx::to_records(&corpus.ops), seed, 50);
        let tx_batches = fx::random_chunks(&fx::to_records(&corpus.tx_info), seed + 1, 8);
        let batched = run_extract(ops_batches, tx_batches, fx::LAST_COMMIT_LSN, 10).await;
        assert_result(&batched, fx::LAST_COMMIT_LSN);
        assert_eq!(fingerprint(&batched), fingerprint(&baseline));
    }
}

pub async fn test_later_checkpoint() {
    let corpus = fx::extract_corpus();
    let result = run_extract(
        vec![fx::to_records(&corpus.ops)],
        vec![fx::to_records(&corpus.tx_info)],
        fx::LATER_COMMIT_LSN,
        10,
    )
    .await;
    let expected = fx::expected_xids(fx::LATER_COMMIT_LSN);
    let emitted: Vec<u64> = result.iter().map(|tx| tx.xid).collect();
    assert_eq!(emitted, expected);
    // transactions whole even with the later checkpoint
    let last = result.last().expect("publish tx emitted");
    assert_eq!(last.operations.len(), 24);
    // the transaction at the checkpoint itself is excluded
    assert!(!emitted.contains(&fx::corpus_xid(9)));
}
