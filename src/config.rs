/**
 * @module config
 * @description Configuration management for the tributary migration pipeline
 *
 * This module provides a flexible configuration system supporting both
 * file-based and default configurations. Every CLI flag maps onto a config
 * field, so a deployment can be driven entirely from `config.yaml`, entirely
 * from the command line, or a mix (CLI wins).
 *
 * ## Configuration Loading Strategy
 *
 * The `load_config()` function implements a smart search algorithm:
 * 1. Use the explicit path when one is given
 * 2. Otherwise start from the executable's directory
 * 3. Search up to 3 parent directories for config.yaml
 * 4. Fall back to hardcoded defaults if no file found
 *
 * This approach supports multiple deployment scenarios:
 * - Development: config.yaml in the project root
 * - Testing: explicit --config with a scratch file
 * - Production: config.yaml alongside the executable
 *
 * ## Configuration Structures
 *
 * ### ExtractConfig
 * - `ops_topic` / `tx_topic`: topic dumps (or broker topics) to consume
 * - `batch_size`: records per consumer pull (default: 256)
 * - `tx_buffer_slack`: boundaries that must be observed past the buffered
 *   head before it is emitted (default: 10)
 * - `last_commit_lsn` / `oldest_active_xid`: the initial resume point used
 *   when `--resume` is not given
 *
 * ### TargetConfig
 * - `db_uri`: PostgreSQL connection URI for the target schema
 *
 * ### StateConfig
 * - `dir`: state store directory (default: "state_data")
 * - `cache` / `search_cache`: optional read cache layers (default: off)
 *
 * ### PipelineConfig
 * - `mode`: `strict` halts on unclassified transactions (initial
 *   migration), `permissive` skips and records them (catch-up streaming)
 * - `poison_dir`: where undeliverable transactions are dumped
 * - `max_retries` / `retry_base_ms`: backoff policy for transient faults
 * - `pull_timeout_secs` / `commit_timeout_secs`: timeouts on consumer
 *   pulls and target commits; a timeout counts as a transient fault
 *
 * ## Error Handling
 *
 * Configuration loading is resilient: a missing file means defaults, a
 * parse error is logged and means defaults. Availability over perfection.
 */

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub target: TargetConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractConfig {
    #[serde(default)]
    pub ops_topic: Option<String>,
    #[serde(default)]
    pub tx_topic: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_tx_buffer_slack")]
    pub tx_buffer_slack: usize,
    #[serde(default)]
    pub last_commit_lsn: u64,
    #[serde(default)]
    pub oldest_active_xid: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    #[serde(default)]
    pub db_uri: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: String,
    #[serde(default)]
    pub cache: bool,
    #[serde(default)]
    pub search_cache: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    /// Halt on unclassified or untransformable transactions
    Strict,
    /// Skip, count, and dump them instead
    Permissive,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_mode")]
    pub mode: PipelineMode,
    #[serde(default = "default_poison_dir")]
    pub poison_dir: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_pull_timeout_secs")]
    pub pull_timeout_secs: u64,
    #[serde(default = "default_commit_timeout_secs")]
    pub commit_timeout_secs: u64,
}

fn default_batch_size() -> usize {
    256
}

fn default_tx_buffer_slack() -> usize {
    10
}

fn default_state_dir() -> String {
    "state_data".to_string()
}

fn default_mode() -> PipelineMode {
    PipelineMode::Strict
}

fn default_poison_dir() -> String {
    "poison".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    100
}

fn default_pull_timeout_secs() -> u64 {
    30
}

fn default_commit_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Config {
            extract: ExtractConfig::default(),
            target: TargetConfig::default(),
            state: StateConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for ExtractConfig {
    fn default() -> Self {
        ExtractConfig {
            ops_topic: None,
            tx_topic: None,
            batch_size: default_batch_size(),
            tx_buffer_slack: default_tx_buffer_slack(),
            last_commit_lsn: 0,
            oldest_active_xid: 0,
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        TargetConfig { db_uri: None }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            dir: default_state_dir(),
            cache: false,
            search_cache: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            mode: default_mode(),
            poison_dir: default_poison_dir(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            pull_timeout_secs: default_pull_timeout_secs(),
            commit_timeout_secs: default_commit_timeout_secs(),
        }
    }
}

/// How many ancestor directories of the executable are checked for a
/// config.yaml (the executable itself sits in target/<profile>/, so the
/// project root is a few levels up)
const CONFIG_SEARCH_DEPTH: usize = 4;

/// Read and parse one candidate file; `None` means fall back to defaults
fn read_config_file(path: &Path) -> Option<Config> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            error!("Cannot read {}: {e}", path.display());
            return None;
        }
    };
    match serde_yaml::from_str(&contents) {
        Ok(config) => {
            debug!("📄 Configuration loaded from {}", path.display());
            Some(config)
        }
        Err(e) => {
            error!("Invalid YAML in {}: {e}", path.display());
            None
        }
    }
}

/// Locate config.yaml next to the executable or in its nearest ancestors
fn discover_config_file() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent()?
        .ancestors()
        .take(CONFIG_SEARCH_DEPTH)
        .map(|dir| dir.join("config.yaml"))
        .find(|candidate| candidate.exists())
}

// Load configuration from an explicit path or by searching near the executable
pub fn load_config(config_path: Option<String>) -> Config {
    let candidate = match config_path {
        Some(path) => Some(PathBuf::from(path)),
        None => discover_config_file(),
    };
    let config = match candidate {
        Some(path) => read_config_file(&path),
        None => None,
    };
    config.unwrap_or_else(|| {
        debug!("📄 Using default configuration");
        Config::default()
    })
}
