//! State Store: Cross-Transaction Facts with Transactional Visibility
//!
//! The load stage needs facts that span transactions: which target draft a
//! source bucket belongs to, which pids have been minted, which legacy
//! secret keys decrypt token payloads. This module keeps those facts in a
//! sled embedded database with one tree per named namespace.
//!
//! ## Namespaces
//!
//! The namespace set is closed: `buckets`, `drafts`, `parents`,
//! `secret_keys`, `pids`, `communities`. Each maps a stable source-side key
//! to a JSON document.
//! A namespace may declare a validator that rejects writes whose document
//! does not match the expected shape; the `buckets` namespace for example
//! only accepts `{"draft_id": …}` documents.
//!
//! ## Transactional Visibility
//!
//! Writes made while replaying a transaction must not become durable unless
//! the target database commit succeeds. Loaders therefore write through a
//! [`StateScope`]: an overlay that buffers writes (validating eagerly) and
//! serves reads from the overlay first. The driver commits the scope only
//! after the target transaction commits; dropping the scope discards the
//! buffered writes.
//!
//! ## Caching
//!
//! Two optional read caches can be layered in front: a primary cache for
//! point lookups and a search cache for namespace scans. Both default off
//! and stay off in tests.

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown state namespace: {0}")]
    UnknownNamespace(String),

    #[error("Validation failed for {namespace}/{key}: {reason}")]
    Validation {
        namespace: String,
        key: String,
        reason: String,
    },

    #[error("State lookup miss: {namespace}/{key}")]
    Missing { namespace: String, key: String },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Shape check applied to every write in a namespace
pub type Validator = fn(&Value) -> std::result::Result<(), String>;

/// The closed set of namespaces
pub const NAMESPACES: &[&str] = &[
    "buckets",
    "drafts",
    "parents",
    "secret_keys",
    "pids",
    "communities",
];

/// Cache layers in front of the store; both default off
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheConfig {
    pub primary: bool,
    pub search: bool,
}

fn validate_buckets(value: &Value) -> std::result::Result<(), String> {
    match value.get("draft_id") {
        Some(Value::String(_)) => Ok(()),
        _ => Err("bucket entries must carry a draft_id string".to_string()),
    }
}

fn validate_parents(value: &Value) -> std::result::Result<(), String> {
    let latest = matches!(value.get("latest_id"), Some(Value::String(_)));
    let next_draft = matches!(value.get("next_draft_id"), Some(Value::String(_)));
    if latest || next_draft {
        Ok(())
    } else {
        Err("parent entries must carry latest_id or next_draft_id".to_string())
    }
}

pub struct StateStore {
    db: Mutex<Option<sled::Db>>,
    trees: HashMap<&'static str, sled::Tree>,
    validators: HashMap<&'static str, Validator>,
    primary_cache: Option<Mutex<HashMap<(String, String), Option<Value>>>>,
    search_cache: Option<Mutex<HashMap<String, Vec<(String, Value)>>>>,
}

impl StateStore {
    /// Open (or initialize) the store under a directory
    pub fn open<P: AsRef<Path>>(path: P, cache: CacheConfig) -> Result<Self> {
        let config = sled::Config::new()
            .path(path)
            .flush_every_ms(Some(100))
            .cache_capacity(64 * 1024 * 1024)
            .mode(sled::Mode::HighThroughput);
        Self::from_config(config, cache)
    }

    /// A throwaway in-memory store for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        Self::from_config(config, CacheConfig::default())
    }

    fn from_config(config: sled::Config, cache: CacheConfig) -> Result<Self> {
        let db = config.open()?;
        let mut trees = HashMap::new();
        for namespace in NAMESPACES {
            trees.insert(*namespace, db.open_tree(namespace)?);
        }
        let mut validators: HashMap<&'static str, Validator> = HashMap::new();
        validators.insert("buckets", validate_buckets);
        validators.insert("parents", validate_parents);
        Ok(Self {
            db: Mutex::new(Some(db)),
            trees,
            validators,
            primary_cache: cache.primary.then(|| Mutex::new(HashMap::new())),
            search_cache: cache.search.then(|| Mutex::new(HashMap::new())),
        })
    }

    fn tree(&self, namespace: &str) -> Result<&sled::Tree> {
        self.trees
            .get(namespace)
            .ok_or_else(|| StateError::UnknownNamespace(namespace.to_string()))
    }

    fn validate(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        if let Some(validator) = self.validators.get(namespace) {
            validator(value).map_err(|reason| StateError::Validation {
                namespace: namespace.to_string(),
                key: key.to_string(),
                reason,
            })?;
        }
        Ok(())
    }

    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        if let Some(cache) = &self.primary_cache {
            let cached = cache
                .lock()
                .unwrap()
                .get(&(namespace.to_string(), key.to_string()))
                .cloned();
            if let Some(value) = cached {
                return Ok(value);
            }
        }
        let tree = self.tree(namespace)?;
        let value = match tree.get(key.as_bytes())? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        if let Some(cache) = &self.primary_cache {
            cache
                .lock()
                .unwrap()
                .insert((namespace.to_string(), key.to_string()), value.clone());
        }
        Ok(value)
    }

    /// Durable write outside any transaction scope (seeding, repairs)
    pub fn insert(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        self.validate(namespace, key, &value)?;
        let tree = self.tree(namespace)?;
        tree.insert(key.as_bytes(), serde_json::to_vec(&value)?)?;
        self.refresh_caches(namespace, key, Some(value));
        Ok(())
    }

    /// All entries of a namespace, in key order
    pub fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>> {
        if let Some(cache) = &self.search_cache {
            if let Some(entries) = cache.lock().unwrap().get(namespace) {
                return Ok(entries.clone());
            }
        }
        let tree = self.tree(namespace)?;
        let mut entries = Vec::new();
        for item in tree.iter() {
            let (key, bytes) = item?;
            entries.push((
                String::from_utf8_lossy(&key).to_string(),
                serde_json::from_slice(&bytes)?,
            ));
        }
        if let Some(cache) = &self.search_cache {
            cache
                .lock()
                .unwrap()
                .insert(namespace.to_string(), entries.clone());
        }
        Ok(entries)
    }

    fn refresh_caches(&self, namespace: &str, key: &str, value: Option<Value>) {
        if let Some(cache) = &self.primary_cache {
            cache
                .lock()
                .unwrap()
                .insert((namespace.to_string(), key.to_string()), value);
        }
        if let Some(cache) = &self.search_cache {
            cache.lock().unwrap().remove(namespace);
        }
    }

    /// Begin a transaction-scoped overlay
    pub fn begin_scope(&self) -> StateScope<'_> {
        StateScope {
            store: self,
            writes: Vec::new(),
        }
    }

    /// Publish a scope's buffered writes. Invoked by the driver strictly
    /// after the target transaction commits.
    pub fn commit_scope(&self, scope: StateScope<'_>) -> Result<()> {
        for (namespace, key, value) in scope.writes {
            let tree = self.tree(namespace)?;
            tree.insert(key.as_bytes(), serde_json::to_vec(&value)?)?;
            self.refresh_caches(namespace, &key, Some(value));
        }
        Ok(())
    }

    /// Flush and close, ensuring all published writes are durable
    pub async fn close(&self) -> Result<()> {
        info!("Flushing state store to disk...");
        let db = self.db.lock().unwrap().take();
        if let Some(db) = db {
            db.flush_async().await?;
            info!("✅ State store flushed");
        }
        Ok(())
    }
}

/// Buffered writes for one replayed transaction. Reads see the overlay
/// first; writes validate eagerly and become durable only via
/// [`StateStore::commit_scope`]. Dropping the scope discards everything.
pub struct StateScope<'a> {
    store: &'a StateStore,
    writes: Vec<(&'static str, String, Value)>,
}

impl<'a> StateScope<'a> {
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        for (ns, k, value) in self.writes.iter().rev() {
            if *ns == namespace && k == key {
                return Ok(Some(value.clone()));
            }
        }
        self.store.get(namespace, key)
    }

    /// A lookup whose absence is a fault (a missing cross-Tx reference)
    pub fn require(&self, namespace: &str, key: &str) -> Result<Value> {
        self.get(namespace, key)?.ok_or_else(|| StateError::Missing {
            namespace: namespace.to_string(),
            key: key.to_string(),
        })
    }

    pub fn set(&mut self, namespace: &'static str, key: &str, value: Value) -> Result<()> {
        // namespace existence and shape are both checked at write time so a
        // bad write surfaces inside the failing transaction, not at commit
        self.store.tree(namespace)?;
        self.store.validate(namespace, key, &value)?;
        self.writes.push((namespace, key.to_string(), value));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}
