//! Cache records and key handling.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{Result, TollgateError};

/// One cached value with its bookkeeping.
///
/// This is also the persisted record shape of the durable tier:
/// `{ key, value, createdAt, expiresAt, lastAccessed, hits, tags }`, with
/// timestamps in Unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T = serde_json::Value> {
    pub key: String,
    pub value: T,
    pub created_at: u64,
    pub expires_at: u64,
    pub last_accessed: u64,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl<T> CacheEntry<T> {
    /// A fresh entry created at `now` that expires after `ttl`.
    pub fn new(key: impl Into<String>, value: T, now: u64, ttl: Duration, tags: Vec<String>) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self {
            key: key.into(),
            value,
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
            last_accessed: now,
            hits: 0,
            tags,
        }
    }

    /// Logically present: `expires_at` lies strictly after `now`.
    pub fn is_fresh(&self, now: u64) -> bool {
        self.expires_at > now
    }

    /// Record a read at `now`.
    pub fn touch(&mut self, now: u64) {
        self.last_accessed = now;
        self.hits += 1;
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

impl CacheEntry {
    /// Parse the durable record stored under `key`. Any failure is reported
    /// as corruption of that key.
    pub fn decode(key: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| TollgateError::CacheCorruption {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
///
/// Distinct keys that sanitize to the same string share one cache slot.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Wall-clock time in Unix epoch milliseconds.
pub(crate) fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
