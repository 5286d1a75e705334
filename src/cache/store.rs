//! Durable tier backends.
//!
//! The durable tier is a flat namespace of string records with a byte
//! budget. A write that would exceed the budget fails with
//! [`TollgateError::StorageExhausted`]; the cache reacts by pruning, the
//! store itself never evicts.
//!
//! - [`FileStore`] — one `<key>.json` file per record in a directory,
//!   written atomically via tmp + rename.
//! - [`MemoryStore`] — process-local map, for tests and for processes that
//!   must not touch disk.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::{Result, TollgateError};

const RECORD_EXTENSION: &str = "json";

/// Byte-bounded record storage backing the durable cache tier.
///
/// Keys handed to a store are already namespaced and sanitized
/// (`[A-Za-z0-9_-]` only).
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a record. `Ok(None)` when absent.
    async fn read(&self, key: &str) -> Result<Option<String>>;

    /// Create or replace a record.
    async fn write(&self, key: &str, blob: &str) -> Result<()>;

    /// Replace a record only while it still reads exactly `expected`.
    ///
    /// Returns `Ok(false)` without writing when the record was deleted or
    /// changed in the meantime.
    async fn replace_if_unchanged(&self, key: &str, expected: &str, blob: &str) -> Result<bool>;

    /// Delete a record. Deleting an absent record is not an error.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Every key currently stored.
    async fn keys(&self) -> Result<Vec<String>>;
}

fn exhausted(needed: u64, budget: u64) -> TollgateError {
    TollgateError::StorageExhausted { needed, budget }
}

// ============================================================================
// MemoryStore
// ============================================================================

/// In-process [`DurableStore`] with a byte budget over keys plus values.
#[derive(Debug)]
pub struct MemoryStore {
    budget: u64,
    inner: Mutex<MemoryRecords>,
}

#[derive(Debug, Default)]
struct MemoryRecords {
    records: HashMap<String, String>,
    used: u64,
}

impl MemoryStore {
    /// A store that refuses writes beyond `budget` bytes.
    pub fn with_budget(budget: u64) -> Self {
        Self {
            budget,
            inner: Mutex::new(MemoryRecords::default()),
        }
    }

    /// A store without a byte ceiling.
    pub fn unbounded() -> Self {
        Self::with_budget(u64::MAX)
    }

    /// Bytes currently accounted against the budget.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).used
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::unbounded()
    }
}

fn record_size(key: &str, blob: &str) -> u64 {
    (key.len() + blob.len()) as u64
}

impl MemoryRecords {
    fn put(&mut self, key: &str, blob: &str, budget: u64) -> Result<()> {
        let old = self
            .records
            .get(key)
            .map_or(0, |existing| record_size(key, existing));
        let needed = self.used - old + record_size(key, blob);
        if needed > budget {
            return Err(exhausted(needed, budget));
        }
        self.records.insert(key.to_string(), blob.to_string());
        self.used = needed;
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.records.get(key).cloned())
    }

    async fn write(&self, key: &str, blob: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.put(key, blob, self.budget)
    }

    async fn replace_if_unchanged(&self, key: &str, expected: &str, blob: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.records.get(key).map(String::as_str) != Some(expected) {
            return Ok(false);
        }
        inner.put(key, blob, self.budget)?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(blob) = inner.records.remove(key) {
            inner.used -= record_size(key, &blob);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.records.keys().cloned().collect())
    }
}

// ============================================================================
// FileStore
// ============================================================================

/// Directory-backed [`DurableStore`].
///
/// Usage is measured once at [`open`](Self::open) and then tracked in
/// process; other processes writing to the same directory are not seen.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    budget: u64,
    used: tokio::sync::Mutex<u64>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, budget: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            TollgateError::Storage(format!("failed to create cache dir {}: {e}", dir.display()))
        })?;
        let used = scan_usage(&dir)?;
        tracing::debug!(dir = %dir.display(), used, budget, "opened file store");
        Ok(Self {
            dir,
            budget,
            used: tokio::sync::Mutex::new(used),
        })
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes currently accounted against the budget.
    pub async fn used_bytes(&self) -> u64 {
        *self.used.lock().await
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{RECORD_EXTENSION}"))
    }

    /// Budget check plus atomic write. The caller holds the `used` lock.
    async fn put(&self, used: &mut u64, path: &Path, blob: &str) -> Result<()> {
        let old = file_len(path).await?;
        let needed = used.saturating_sub(old) + blob.len() as u64;
        if needed > self.budget {
            return Err(exhausted(needed, self.budget));
        }

        // Write to tmp file first, then rename for atomicity
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, blob).await.map_err(|e| {
            TollgateError::Storage(format!("failed to write {}: {e}", tmp_path.display()))
        })?;
        tokio::fs::rename(&tmp_path, path).await.map_err(|e| {
            TollgateError::Storage(format!(
                "failed to rename {} → {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })?;
        *used = needed;
        Ok(())
    }
}

async fn read_record(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TollgateError::Storage(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

fn scan_usage(dir: &Path) -> Result<u64> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        TollgateError::Storage(format!("failed to list cache dir {}: {e}", dir.display()))
    })?;
    let mut used = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
            used += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(used)
}

async fn file_len(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(TollgateError::Storage(format!(
            "failed to stat {}: {e}",
            path.display()
        ))),
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn read(&self, key: &str) -> Result<Option<String>> {
        read_record(&self.record_path(key)).await
    }

    async fn write(&self, key: &str, blob: &str) -> Result<()> {
        let path = self.record_path(key);
        let mut used = self.used.lock().await;
        self.put(&mut used, &path, blob).await
    }

    async fn replace_if_unchanged(&self, key: &str, expected: &str, blob: &str) -> Result<bool> {
        let path = self.record_path(key);
        // every mutation in this process takes the same lock
        let mut used = self.used.lock().await;
        if read_record(&path).await?.as_deref() != Some(expected) {
            return Ok(false);
        }
        self.put(&mut used, &path, blob).await?;
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.record_path(key);
        let mut used = self.used.lock().await;
        let len = file_len(&path).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                *used = used.saturating_sub(len);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TollgateError::Storage(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            TollgateError::Storage(format!("failed to list {}: {e}", self.dir.display()))
        })?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            TollgateError::Storage(format!("failed to list {}: {e}", self.dir.display()))
        })? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }
}
