//! TTL-aware multi-value store for values extracted during scenario
//! runs.
//!
//! Each key maps to a list of entries kept in insertion order. Reads
//! skip expired entries lazily; a background task (or an explicit
//! [`ValuePool::cleanup`] call) sweeps them out.

use crate::duration::HumanDuration;
use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long [`ValuePool::close`] waits for the cleanup task to stop.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Source tag recorded for values loaded through [`ValuePool::import`].
pub const IMPORT_SOURCE: &str = "import";

/// Live values per key, as produced by [`ValuePool::snapshot`].
pub type PoolSnapshot = BTreeMap<String, Vec<String>>;

/// Pool limits and expiry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// TTL applied by [`ValuePool::add`]. Zero means entries never
    /// expire.
    pub default_ttl: HumanDuration,
    pub max_entries_per_key: usize,
    pub max_total_entries: usize,
    /// Period of the background sweep. Zero disables it.
    pub cleanup_interval: HumanDuration,
    pub allow_duplicates: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_ttl: HumanDuration(Duration::from_secs(30 * 60)),
            max_entries_per_key: 100,
            max_total_entries: 10_000,
            cleanup_interval: HumanDuration(Duration::from_secs(60)),
            allow_duplicates: false,
        }
    }
}

/// Aggregate counters reported by [`ValuePool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_entries: usize,
    pub key_count: usize,
    pub expired_removed: u64,
    pub added_count: u64,
    pub retrieved_count: u64,
}

/// Read-only view of one live entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub value: String,
    pub source: String,
    pub use_count: u64,
    pub age: Duration,
    /// `None` when the entry never expires.
    pub ttl_remaining: Option<Duration>,
}

#[derive(Debug)]
struct PoolEntry {
    value: String,
    source: String,
    created_at: Instant,
    expires_at: Option<Instant>,
    use_count: AtomicU64,
}

impl PoolEntry {
    fn new(value: String, source: String, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            source,
            created_at: now,
            expires_at: expiry(ttl, now),
            use_count: AtomicU64::new(0),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn touch(&self) -> String {
        self.use_count.fetch_add(1, Ordering::Relaxed);
        self.value.clone()
    }
}

fn expiry(ttl: Duration, now: Instant) -> Option<Instant> {
    if ttl.is_zero() {
        None
    } else {
        now.checked_add(ttl)
    }
}

#[derive(Debug, Default)]
struct PoolState {
    entries: HashMap<String, Vec<PoolEntry>>,
    total: usize,
    expired_removed: u64,
    added: u64,
}

impl PoolState {
    /// Drop every expired entry, returning how many were removed.
    fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, list| {
            let before = list.len();
            list.retain(|entry| !entry.is_expired(now));
            removed += before - list.len();
            !list.is_empty()
        });
        self.total -= removed;
        self.expired_removed += removed as u64;
        removed
    }
}

#[derive(Debug)]
struct Shared {
    config: PoolConfig,
    state: RwLock<PoolState>,
    retrieved: AtomicU64,
}

impl Shared {
    fn cleanup(&self) -> usize {
        self.state.write().sweep(Instant::now())
    }
}

#[derive(Debug)]
struct CleanupTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Thread-safe value pool. Reads share a lock; writes are exclusive.
#[derive(Debug)]
pub struct ValuePool {
    shared: Arc<Shared>,
    cleanup_task: Mutex<Option<CleanupTask>>,
}

impl Default for ValuePool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ValuePool {
    /// Create a pool. When `cleanup_interval` is non-zero and a Tokio
    /// runtime is available, a periodic sweep task is started.
    pub fn new(config: PoolConfig) -> Self {
        let interval = config.cleanup_interval.as_duration();
        let shared = Arc::new(Shared {
            config,
            state: RwLock::new(PoolState::default()),
            retrieved: AtomicU64::new(0),
        });

        let cleanup_task = if interval.is_zero() {
            None
        } else {
            spawn_cleanup(Arc::downgrade(&shared), interval)
        };

        Self {
            shared,
            cleanup_task: Mutex::new(cleanup_task),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Insert with the default TTL. Returns `false` only when the pool
    /// is full even after sweeping expired entries.
    pub fn add(&self, key: &str, value: &str) -> bool {
        let ttl = self.shared.config.default_ttl.as_duration();
        self.insert(key, value, "", ttl, true)
    }

    pub fn add_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> bool {
        self.insert(key, value, "", ttl, true)
    }

    pub fn add_with_source(&self, key: &str, value: &str, source: &str) -> bool {
        let ttl = self.shared.config.default_ttl.as_duration();
        self.insert(key, value, source, ttl, true)
    }

    fn insert(&self, key: &str, value: &str, source: &str, ttl: Duration, dedup: bool) -> bool {
        let config = &self.shared.config;
        let now = Instant::now();
        let mut state = self.shared.state.write();

        if dedup && !config.allow_duplicates {
            if let Some(existing) = state.entries.get_mut(key).and_then(|list| {
                list.iter_mut()
                    .find(|entry| entry.value == value && !entry.is_expired(now))
            }) {
                existing.expires_at = expiry(ttl, now);
                return true;
            }
        }

        // A key already at its own limit swaps its oldest entry out, so
        // the global count does not grow.
        let replaces_oldest = config.max_entries_per_key > 0
            && state
                .entries
                .get(key)
                .is_some_and(|list| list.len() >= config.max_entries_per_key);

        if !replaces_oldest && state.total >= config.max_total_entries {
            let reclaimed = state.sweep(now);
            debug!(reclaimed, "pool full, swept expired entries");
            if state.total >= config.max_total_entries {
                debug!(key, "pool capacity exhausted, rejecting value");
                return false;
            }
        }

        let list = state.entries.entry(key.to_string()).or_default();
        list.push(PoolEntry::new(value.to_string(), source.to_string(), ttl, now));
        let mut dropped = 0;
        if config.max_entries_per_key > 0 && list.len() > config.max_entries_per_key {
            dropped = list.len() - config.max_entries_per_key;
            list.drain(..dropped);
        }
        state.total = state.total + 1 - dropped;
        state.added += 1;
        true
    }

    /// First live value for `key`, in insertion order.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let state = self.shared.state.read();
        let value = state
            .entries
            .get(key)?
            .iter()
            .find(|entry| !entry.is_expired(now))
            .map(PoolEntry::touch)?;
        self.shared.retrieved.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Most recently inserted live value for `key`.
    pub fn get_latest(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let state = self.shared.state.read();
        let value = state
            .entries
            .get(key)?
            .iter()
            .rev()
            .find(|entry| !entry.is_expired(now))
            .map(PoolEntry::touch)?;
        self.shared.retrieved.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    pub fn get_all(&self, key: &str) -> Vec<String> {
        let now = Instant::now();
        let state = self.shared.state.read();
        state
            .entries
            .get(key)
            .map(|list| {
                list.iter()
                    .filter(|entry| !entry.is_expired(now))
                    .map(|entry| entry.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shared
            .state
            .read()
            .entries
            .get(key)
            .is_some_and(|list| list.iter().any(|entry| !entry.is_expired(now)))
    }

    /// Remove every entry under `key`, returning how many there were.
    pub fn remove(&self, key: &str) -> usize {
        let mut state = self.shared.state.write();
        let removed = state.entries.remove(key).map_or(0, |list| list.len());
        state.total -= removed;
        removed
    }

    /// Remove the first entry under `key` holding exactly `value`.
    pub fn remove_value(&self, key: &str, value: &str) -> bool {
        let mut state = self.shared.state.write();
        let Some(list) = state.entries.get_mut(key) else {
            return false;
        };
        let Some(pos) = list.iter().position(|entry| entry.value == value) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            state.entries.remove(key);
        }
        state.total -= 1;
        true
    }

    pub fn clear(&self) {
        let mut state = self.shared.state.write();
        state.entries.clear();
        state.total = 0;
    }

    /// Sweep expired entries now, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        self.shared.cleanup()
    }

    /// Live values per key.
    pub fn snapshot(&self) -> PoolSnapshot {
        let now = Instant::now();
        let state = self.shared.state.read();
        state
            .entries
            .iter()
            .filter_map(|(key, list)| {
                let values: Vec<String> = list
                    .iter()
                    .filter(|entry| !entry.is_expired(now))
                    .map(|entry| entry.value.clone())
                    .collect();
                (!values.is_empty()).then(|| (key.clone(), values))
            })
            .collect()
    }

    /// Bulk-load values with the default TTL, skipping duplicate
    /// checks. Capacity limits still apply. Returns how many values
    /// were stored.
    pub fn import<I, V>(&self, data: I) -> usize
    where
        I: IntoIterator<Item = (String, V)>,
        V: IntoIterator<Item = String>,
    {
        let ttl = self.shared.config.default_ttl.as_duration();
        let mut inserted = 0;
        for (key, values) in data {
            for value in values {
                if self.insert(&key, &value, IMPORT_SOURCE, ttl, false) {
                    inserted += 1;
                }
            }
        }
        inserted
    }

    /// Serialise [`Self::snapshot`] as JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.snapshot()).context("Failed to serialize pool snapshot")
    }

    /// Load a JSON document produced by [`Self::to_json`].
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let snapshot: PoolSnapshot =
            serde_json::from_str(json).context("Failed to parse pool snapshot")?;
        Ok(self.import(snapshot))
    }

    /// Keys that currently hold at least one live value, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let state = self.shared.state.read();
        let mut keys: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, list)| list.iter().any(|entry| !entry.is_expired(now)))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Live entries under `key` with their metadata.
    pub fn inspect(&self, key: &str) -> Vec<EntryInfo> {
        let now = Instant::now();
        let state = self.shared.state.read();
        let Some(list) = state.entries.get(key) else {
            return Vec::new();
        };
        list.iter()
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| EntryInfo {
                value: entry.value.clone(),
                source: entry.source.clone(),
                use_count: entry.use_count.load(Ordering::Relaxed),
                age: now.saturating_duration_since(entry.created_at),
                ttl_remaining: entry.expires_at.map(|at| at.saturating_duration_since(now)),
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.read();
        PoolStats {
            total_entries: state.total,
            key_count: state.entries.len(),
            expired_removed: state.expired_removed,
            added_count: state.added,
            retrieved_count: self.shared.retrieved.load(Ordering::Relaxed),
        }
    }

    /// Stop the background sweep. Waits up to a few seconds for the
    /// task to finish, then gives up on it. Calling this more than once
    /// is a no-op.
    pub async fn close(&self) {
        let task = self.cleanup_task.lock().take();
        let Some(task) = task else {
            return;
        };

        let _ = task.shutdown.send(true);
        match tokio::time::timeout(CLOSE_TIMEOUT, task.handle).await {
            Ok(Ok(())) => debug!("pool cleanup task stopped"),
            Ok(Err(err)) => warn!("pool cleanup task ended abnormally: {}", err),
            Err(_) => warn!("timed out waiting for pool cleanup task, continuing shutdown"),
        }
    }
}

impl Drop for ValuePool {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup_task.get_mut().take() {
            let _ = task.shutdown.send(true);
        }
    }
}

fn spawn_cleanup(shared: Weak<Shared>, interval: Duration) -> Option<CleanupTask> {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            warn!("no Tokio runtime available, pool background cleanup disabled");
            return None;
        }
    };

    let (shutdown, mut stop) = watch::channel(false);
    let handle = runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(shared) = shared.upgrade() else {
                        break;
                    };
                    let removed = shared.cleanup();
                    if removed > 0 {
                        debug!(removed, "pool sweep removed expired entries");
                    }
                }
                // Only `true` is ever sent; a closed channel means the pool is gone.
                _ = stop.changed() => break,
            }
        }
    });

    Some(CleanupTask { shutdown, handle })
}
