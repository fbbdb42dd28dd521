/**
 * # Tributary - Transactional CDC Migration Pipeline
 *
 * Tributary replays a source database's row-change log against a target
 * relational schema, one whole source transaction at a time.
 *
 * ## Usage
 *
 * ```bash
 * # Replay two topic dumps against a target database
 * tributary run --ops-topic ops.jsonl --tx-topic tx.jsonl \
 *     --target-db postgres://localhost/rdm --state-dir state_data
 *
 * # Resume from the checkpoint persisted in the target
 * tributary run --ops-topic ops.jsonl --tx-topic tx.jsonl \
 *     --target-db postgres://localhost/rdm --state-dir state_data --resume
 *
 * # Render the SQL without touching the target
 * tributary run --ops-topic ops.jsonl --tx-topic tx.jsonl --dry-run
 * ```
 *
 * ## Lifecycle Behavior
 *
 * The pipeline runs until both input streams end or an unrecoverable fault
 * halts it. SIGINT (Ctrl+C) requests cancellation, which is honored between
 * transactions: the in-flight target transaction rolls back and the
 * checkpoint stays where it was.
 *
 * Exit code 0 on clean shutdown, 1 on unrecoverable classification or load
 * failure. After graceful cleanup the process uses std::process::exit(0)
 * due to sled database background threads.
 */

use clap::{Parser, Subcommand};
use std::error::Error;
use tokio::sync::watch;
use tracing::{error, info};

use tributary::config::{load_config, PipelineMode};
use tributary::extract::{JsonlConsumer, LogExtractor};
use tributary::load::{Checkpoint, TargetDb};
use tributary::logging::init_logging;
use tributary::pipeline::Driver;
use tributary::state::{CacheConfig, StateStore};
use tributary::utils::RetryPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay the change log against the target database
    Run {
        /// Ops topic dump (newline-delimited JSON)
        #[arg(long)]
        ops_topic: Option<String>,

        /// Transaction-boundary topic dump
        #[arg(long)]
        tx_topic: Option<String>,

        /// Target database connection URI
        #[arg(long)]
        target_db: Option<String>,

        /// State store directory
        #[arg(long)]
        state_dir: Option<String>,

        /// Resume from the checkpoint persisted in the target database
        #[arg(long)]
        resume: bool,

        /// Render prepared statements without executing anything
        #[arg(long)]
        dry_run: bool,

        /// Force strict mode (halt on unclassified transactions)
        #[arg(long, conflicts_with = "permissive")]
        strict: bool,

        /// Force permissive mode (skip and record unclassified transactions)
        #[arg(long)]
        permissive: bool,
    },
}

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // Create Tokio runtime explicitly for proper shutdown control
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("Failed to create runtime: {e}")))?;

    let result = runtime.block_on(async_main());

    // Force runtime shutdown with timeout
    runtime.shutdown_timeout(std::time::Duration::from_secs(2));

    result
}

async fn async_main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let args = Args::parse();
    init_logging();

    let start_time = std::time::Instant::now();

    let Command::Run {
        ops_topic,
        tx_topic,
        target_db,
        state_dir,
        resume,
        dry_run,
        strict,
        permissive,
    } = args.command;

    // Load configuration and fold in CLI overrides (CLI wins)
    let mut config = load_config(args.config);
    if let Some(ops_topic) = ops_topic {
        config.extract.ops_topic = Some(ops_topic);
    }
    if let Some(tx_topic) = tx_topic {
        config.extract.tx_topic = Some(tx_topic);
    }
    if let Some(target_db) = target_db {
        config.target.db_uri = Some(target_db);
    }
    if let Some(state_dir) = state_dir {
        config.state.dir = state_dir;
    }
    if strict {
        config.pipeline.mode = PipelineMode::Strict;
    }
    if permissive {
        config.pipeline.mode = PipelineMode::Permissive;
    }

    let ops_topic = config
        .extract
        .ops_topic
        .clone()
        .ok_or("--ops-topic (or extract.ops_topic) is required")?;
    let tx_topic = config
        .extract
        .tx_topic
        .clone()
        .ok_or("--tx-topic (or extract.tx_topic) is required")?;

    info!("🌊 Tributary pipeline initialized");
    info!("📥 Ops topic: {ops_topic}");
    info!("📥 Tx topic: {tx_topic}");

    // Open the state store
    let state = StateStore::open(
        &config.state.dir,
        CacheConfig {
            primary: config.state.cache,
            search: config.state.search_cache,
        },
    )
    .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("State store error: {e}")))?;

    // Connect to the target unless running dry
    let mut target = None;
    if !dry_run {
        let uri = config
            .target
            .db_uri
            .clone()
            .ok_or("--target-db (or target.db_uri) is required unless --dry-run")?;
        target = Some(
            TargetDb::connect(&uri)
                .await
                .map_err(|e| Box::<dyn Error + Send + Sync>::from(format!("Target error: {e}")))?,
        );
    }

    // Resolve the resume point: persisted checkpoint beats configuration
    let mut checkpoint = Checkpoint {
        last_commit_lsn: config.extract.last_commit_lsn,
        oldest_active_xid: config.extract.oldest_active_xid,
    };
    if resume {
        match &target {
            Some(target) => match target.load_checkpoint().await {
                Ok(Some(persisted)) => {
                    info!(
                        "⏮️  Resuming from checkpoint: commit_lsn={}, oldest_xid={}",
                        persisted.last_commit_lsn, persisted.oldest_active_xid
                    );
                    checkpoint = persisted;
                }
                Ok(None) => info!("⏮️  No persisted checkpoint, starting from configuration"),
                Err(e) => {
                    return Err(format!("Failed to load checkpoint: {e}").into());
                }
            },
            None => {
                return Err("--resume requires a target database connection".into());
            }
        }
    }

    // Build the extractor over the two topic consumers
    let ops_consumer = JsonlConsumer::open(&ops_topic)
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(e.to_string()))?
        .with_batch_size(config.extract.batch_size);
    let tx_consumer = JsonlConsumer::open(&tx_topic)
        .map_err(|e| Box::<dyn Error + Send + Sync>::from(e.to_string()))?
        .with_batch_size(config.extract.batch_size);
    let extractor = LogExtractor::new(
        ops_consumer,
        tx_consumer,
        checkpoint.last_commit_lsn,
        checkpoint.oldest_active_xid,
    )
    .with_slack(config.extract.tx_buffer_slack)
    .with_retry(RetryPolicy {
        max_attempts: config.pipeline.max_retries,
        base_delay: std::time::Duration::from_millis(config.pipeline.retry_base_ms),
        ..RetryPolicy::default()
    })
    .with_pull_timeout(std::time::Duration::from_secs(config.pipeline.pull_timeout_secs));

    // Wire Ctrl+C into the driver's cancellation signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Received shutdown signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut driver = Driver::new(extractor, target, state, &config, shutdown_rx);
    let result = driver.run().await;
    driver.close().await;

    let total_runtime = start_time.elapsed();
    info!("💫 Total runtime: {:.2}s", total_runtime.as_secs_f64());

    match result {
        Ok(report) => {
            info!(
                "✅ Done: {} applied, {} ignored, {} skipped",
                report.applied, report.ignored, report.skipped
            );
            // Force exit because sled background threads won't terminate
            std::process::exit(0)
        }
        Err(e) => {
            error!("Pipeline halted: {e}");
            std::process::exit(1)
        }
    }
}
