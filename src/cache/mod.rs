//! Tiered response cache.
//!
//! [`TieredCache`] sits in front of the [`RequestScheduler`](crate::RequestScheduler)
//! so that a fresh result never costs a second outbound call.
//!
//! # Tiers
//!
//! - **Memory** — bounded at `max_memory_items`. A full insert evicts the
//!   entry with the oldest `last_accessed` (linear scan; the tier is small).
//! - **Durable** — any [`DurableStore`], bounded by bytes rather than
//!   entries. Nothing is evicted proactively: a periodic sweep drops expired
//!   records, and a failed write prunes the least recently accessed 20%.
//!
//! A durable hit is promoted into memory and its refreshed access metadata
//! is written back in a background task. The write-back only replaces the
//! exact record it read: if the record was deleted or rewritten meanwhile,
//! the refreshed metadata is dropped.
//!
//! # Failure policy
//!
//! Storage problems never fail a [`fetch`](TieredCache::fetch). Corrupt
//! records are deleted and treated as misses; failed writes degrade to
//! "cached in memory only".

pub mod entry;
pub mod store;

pub use entry::{CacheEntry, sanitize_key};
pub use store::{DurableStore, FileStore, MemoryStore};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::telemetry;
use crate::Result;

use entry::now_epoch_ms;

/// Per-call cache options.
///
/// ```rust
/// # use tollgate::FetchOptions;
/// # use std::time::Duration;
/// let options = FetchOptions::new()
///     .ttl(Duration::from_secs(7 * 24 * 3600))
///     .tag("cadastral")
///     .tag("company_acme");
/// assert!(options.persist);
/// ```
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Lifetime of the stored value. `None` uses the cache's default TTL.
    pub ttl: Option<Duration>,
    /// Labels for [`TieredCache::invalidate_by_tag`].
    pub tags: Vec<String>,
    /// Whether the value is also written to the durable tier. Default: true.
    pub persist: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            tags: Vec::new(),
            persist: true,
        }
    }
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Keep the value in memory only.
    pub fn memory_only(mut self) -> Self {
        self.persist = false;
        self
    }
}

/// Snapshot of cache effectiveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Hits over lookups, e.g. `"66.7%"`; `"0%"` before the first lookup.
    pub hit_rate: String,
    pub memory_items: usize,
    pub disk_items: usize,
}

#[derive(Debug, Clone, Copy)]
enum Tier {
    Memory,
    Disk,
}

impl Tier {
    fn label(self) -> &'static str {
        match self {
            Tier::Memory => "memory",
            Tier::Disk => "disk",
        }
    }
}

enum MemoryLookup {
    Fresh(Value),
    Expired,
    Absent,
}

/// Fast tier: entries plus a touch sequence that orders same-millisecond
/// accesses for LRU.
#[derive(Default)]
struct MemoryTier {
    slots: HashMap<String, Slot>,
    seq: u64,
}

struct Slot {
    entry: CacheEntry,
    seq: u64,
}

impl MemoryTier {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn lookup(&mut self, key: &str, now: u64) -> MemoryLookup {
        let seq = self.next_seq();
        match self.slots.get_mut(key) {
            None => MemoryLookup::Absent,
            Some(slot) if slot.entry.is_fresh(now) => {
                slot.entry.touch(now);
                slot.seq = seq;
                MemoryLookup::Fresh(slot.entry.value.clone())
            }
            Some(_) => {
                self.slots.remove(key);
                MemoryLookup::Expired
            }
        }
    }

    /// Insert, evicting the least recently accessed entry when full.
    /// Returns the evicted key.
    fn insert(&mut self, entry: CacheEntry, capacity: usize) -> Option<String> {
        if capacity == 0 {
            return None;
        }
        let mut evicted = None;
        if !self.slots.contains_key(&entry.key) && self.slots.len() >= capacity {
            evicted = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| (slot.entry.last_accessed, slot.seq))
                .map(|(key, _)| key.clone());
            if let Some(key) = &evicted {
                self.slots.remove(key);
            }
        }
        let seq = self.next_seq();
        self.slots.insert(entry.key.clone(), Slot { entry, seq });
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        self.slots.remove(key).is_some()
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&CacheEntry) -> bool) -> Vec<String> {
        let keys: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| pred(&slot.entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.slots.remove(key);
        }
        keys
    }

    fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }
}

/// Two-tier cache with TTL expiry, LRU memory eviction and tag invalidation.
///
/// One instance per logical cache name; share it behind an `Arc`.
pub struct TieredCache {
    name: String,
    config: CacheConfig,
    prefix: String,
    memory: Mutex<MemoryTier>,
    store: Arc<dyn DurableStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TieredCache {
    /// Create a cache named `name` over an arbitrary durable store.
    pub fn new(name: impl Into<String>, config: CacheConfig, store: Arc<dyn DurableStore>) -> Self {
        let name = name.into();
        let prefix = sanitize_key(&config.prefix);
        info!(cache = %name, max_memory_items = config.max_memory_items, "cache ready");
        Self {
            name,
            config,
            prefix,
            memory: Mutex::new(MemoryTier::default()),
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a cache backed by a [`FileStore`] at `config.dir/<name>`.
    ///
    /// Fails on an invalid config or an unusable directory.
    pub fn open(name: impl Into<String>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let store = FileStore::open(config.dir.join(sanitize_key(&name)), config.max_disk_bytes)?;
        Ok(Self::new(name, config, Arc::new(store)))
    }

    /// Logical cache name, as used in logs and metric labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the cached value for `key`, or run `producer` and cache its result.
    ///
    /// Producer errors propagate and nothing is cached. Storage errors are
    /// logged and never returned.
    pub async fn fetch<T, F, Fut>(&self, key: &str, producer: F, options: FetchOptions) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = sanitize_key(key);
        if let Some(value) = self.lookup(&key).await {
            return Ok(value);
        }

        let value = producer().await?;
        self.store_value(&key, &value, &options).await;
        Ok(value)
    }

    /// Cached value for `key`, without producing on a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(&sanitize_key(key)).await
    }

    /// Store `value` under `key` unconditionally.
    pub async fn insert<T: Serialize>(&self, key: &str, value: &T, options: FetchOptions) {
        self.store_value(&sanitize_key(key), value, &options).await;
    }

    /// Delete `key` from both tiers. Returns whether memory held it.
    pub async fn remove(&self, key: &str) -> bool {
        let key = sanitize_key(key);
        let removed = self.lock().remove(&key);
        self.remove_durable(&key).await;
        removed
    }

    /// Delete every entry tagged `tag` from both tiers.
    ///
    /// Scans the whole durable tier; records are only parsed when their raw
    /// text contains the tag.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let from_memory = self.lock().remove_where(|entry| entry.has_tag(tag));
        for key in &from_memory {
            self.remove_durable(key).await;
        }

        let needle = serde_json::to_string(tag).unwrap_or_else(|_| tag.to_string());
        let mut from_disk = 0;
        for storage_key in self.durable_keys().await {
            let Some(raw) = self.read_raw(&storage_key).await else {
                continue;
            };
            if !raw.contains(&needle) {
                continue;
            }
            if let Ok(entry) = CacheEntry::decode(&storage_key, &raw) {
                if entry.has_tag(tag) {
                    self.delete_storage_key(&storage_key).await;
                    from_disk += 1;
                }
            }
        }

        let count = from_memory.len() + from_disk;
        info!(cache = %self.name, tag, count, "invalidated entries by tag");
        count
    }

    /// Delete expired entries from both tiers, and corrupt durable records.
    pub async fn sweep_expired(&self) -> usize {
        let now = now_epoch_ms();
        let expired = self.lock().remove_where(|entry| !entry.is_fresh(now));
        for key in &expired {
            self.remove_durable(key).await;
        }

        let mut removed = expired.len();
        for storage_key in self.durable_keys().await {
            let Some(raw) = self.read_raw(&storage_key).await else {
                continue;
            };
            let stale = match CacheEntry::decode(&storage_key, &raw) {
                Ok(entry) => !entry.is_fresh(now),
                Err(e) => {
                    warn!(cache = %self.name, key = %storage_key, error = %e, "removing corrupt record");
                    true
                }
            };
            if stale {
                self.delete_storage_key(&storage_key).await;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(cache = %self.name, removed, "expiry sweep finished");
        }
        removed
    }

    /// Delete the least recently accessed share of durable records
    /// (`prune_fraction`, rounded up).
    pub async fn prune_durable(&self) -> usize {
        let mut records = Vec::new();
        for storage_key in self.durable_keys().await {
            if let Some(raw) = self.read_raw(&storage_key).await {
                if let Ok(entry) = CacheEntry::decode(&storage_key, &raw) {
                    records.push((entry.last_accessed, storage_key));
                }
            }
        }
        records.sort();

        let count = (records.len() as f64 * self.config.prune_fraction).ceil() as usize;
        for (_, storage_key) in records.iter().take(count) {
            self.delete_storage_key(storage_key).await;
        }
        warn!(cache = %self.name, removed = count, "pruned durable tier");
        count
    }

    /// Spawn the periodic expiry sweep. The task ends once the cache is dropped.
    /// A zero `sweep_interval`, which [`CacheConfig::validate`] rejects,
    /// runs every second.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let mut period = self.config.sweep_interval;
        if period.is_zero() {
            period = Duration::from_secs(1);
        }
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                cache.sweep_expired().await;
            }
        })
    }

    /// Hit/miss counters and tier sizes.
    pub async fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total == 0 {
            "0%".to_string()
        } else {
            format!("{:.1}%", hits as f64 / total as f64 * 100.0)
        };
        let memory_items = self.lock().slots.len();
        let disk_items = self.durable_keys().await.len();
        CacheMetrics {
            hits,
            misses,
            hit_rate,
            memory_items,
            disk_items,
        }
    }

    /// Whether `key` currently sits in the memory tier (expired or not).
    pub fn in_memory(&self, key: &str) -> bool {
        self.lock().contains(&sanitize_key(key))
    }

    /// Whether `key` currently has a durable record (expired or not).
    pub async fn on_disk(&self, key: &str) -> bool {
        self.read_raw(&self.storage_key(&sanitize_key(key))).await.is_some()
    }

    // ------------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Two-tier lookup. Counts the hit or miss.
    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let found = self.lookup_tiers(key).await;
        match &found {
            Some((_, tier)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL,
                    "cache" => self.name.clone(),
                    "tier" => tier.label()
                )
                .increment(1);
                debug!(cache = %self.name, key, tier = tier.label(), "cache hit");
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "cache" => self.name.clone())
                    .increment(1);
                debug!(cache = %self.name, key, "cache miss");
            }
        }
        found.map(|(value, _)| value)
    }

    async fn lookup_tiers<T: DeserializeOwned>(&self, key: &str) -> Option<(T, Tier)> {
        let now = now_epoch_ms();

        let memory = self.lock().lookup(key, now);
        match memory {
            MemoryLookup::Fresh(value) => {
                return match serde_json::from_value(value) {
                    Ok(value) => Some((value, Tier::Memory)),
                    Err(e) => {
                        warn!(cache = %self.name, key, error = %e, "cached value has unexpected shape, discarding");
                        self.lock().remove(key);
                        self.remove_durable(key).await;
                        None
                    }
                };
            }
            MemoryLookup::Expired => {
                self.remove_durable(key).await;
                return None;
            }
            MemoryLookup::Absent => {}
        }

        let storage_key = self.storage_key(key);
        let raw = self.read_raw(&storage_key).await?;
        let mut entry = match CacheEntry::decode(&storage_key, &raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(cache = %self.name, key, error = %e, "corrupt record, removing");
                self.delete_storage_key(&storage_key).await;
                return None;
            }
        };
        if !entry.is_fresh(now) {
            self.delete_storage_key(&storage_key).await;
            return None;
        }
        let value = match serde_json::from_value(entry.value.clone()) {
            Ok(value) => value,
            Err(e) => {
                warn!(cache = %self.name, key, error = %e, "cached value has unexpected shape, discarding");
                self.delete_storage_key(&storage_key).await;
                return None;
            }
        };

        entry.touch(now);
        self.write_back(storage_key, raw, &entry);
        self.insert_memory(entry);
        Some((value, Tier::Disk))
    }

    /// Persist refreshed access metadata without delaying the caller.
    fn write_back(&self, storage_key: String, read: String, entry: &CacheEntry) {
        let Ok(blob) = serde_json::to_string(entry) else {
            return;
        };
        let store = Arc::clone(&self.store);
        let name = self.name.clone();
        tokio::spawn(async move {
            match store.replace_if_unchanged(&storage_key, &read, &blob).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(cache = %name, key = %storage_key, "record changed before write-back, skipped");
                }
                Err(e) => {
                    debug!(cache = %name, key = %storage_key, error = %e, "access metadata not persisted");
                }
            }
        });
    }

    async fn store_value<T: Serialize>(&self, key: &str, value: &T, options: &FetchOptions) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!(cache = %self.name, key, error = %e, "value is not serializable, not cached");
                return;
            }
        };
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry::new(key, value, now_epoch_ms(), ttl, options.tags.clone());

        if options.persist {
            self.persist(&entry).await;
        } else {
            // an older persisted copy must not resurface after eviction
            self.remove_durable(key).await;
        }
        self.insert_memory(entry);
    }

    async fn persist(&self, entry: &CacheEntry) {
        let blob = match serde_json::to_string(entry) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(cache = %self.name, key = %entry.key, error = %e, "record not serializable");
                return;
            }
        };
        if let Err(e) = self.store.write(&self.storage_key(&entry.key), &blob).await {
            warn!(cache = %self.name, key = %entry.key, error = %e, "durable write failed, pruning");
            metrics::counter!(telemetry::CACHE_WRITE_FAILURES_TOTAL, "cache" => self.name.clone())
                .increment(1);
            self.prune_durable().await;
        }
    }

    fn insert_memory(&self, entry: CacheEntry) {
        let evicted = self.lock().insert(entry, self.config.max_memory_items);
        if let Some(key) = evicted {
            metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL, "cache" => self.name.clone())
                .increment(1);
            debug!(cache = %self.name, key = %key, "evicted least recently used entry");
        }
    }

    async fn durable_keys(&self) -> Vec<String> {
        match self.store.keys().await {
            Ok(keys) => keys
                .into_iter()
                .filter(|k| k.starts_with(&self.prefix))
                .collect(),
            Err(e) => {
                warn!(cache = %self.name, error = %e, "failed to list durable records");
                Vec::new()
            }
        }
    }

    async fn read_raw(&self, storage_key: &str) -> Option<String> {
        match self.store.read(storage_key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(cache = %self.name, key = %storage_key, error = %e, "durable read failed");
                None
            }
        }
    }

    async fn remove_durable(&self, key: &str) {
        self.delete_storage_key(&self.storage_key(key)).await;
    }

    async fn delete_storage_key(&self, storage_key: &str) {
        if let Err(e) = self.store.remove(storage_key).await {
            warn!(cache = %self.name, key = %storage_key, error = %e, "durable delete failed");
        }
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.name)
            .field("prefix", &self.prefix)
            .field("memory_items", &self.lock().slots.len())
            .finish_non_exhaustive()
    }
}
