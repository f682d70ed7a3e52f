//! Explicit per-call response cache
//!
//! Callers invoke `get_or_compute` with a fingerprint key; there is no
//! hidden wrapping, so cache hits and misses stay observable. Entries are
//! stored as JSON values with a TTL, and the oldest entry is evicted when
//! the cache is full.

use crate::client::ProviderError;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};

struct CacheEntry {
    value: serde_json::Value,
    cached_at: Instant,
    ttl: Duration,
}

/// TTL response cache keyed by a fingerprint of the call.
pub struct RequestCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
}

impl RequestCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    /// Return the cached value for `key`, or run `compute`, cache its
    /// result for `ttl`, and return it. Errors are never cached.
    pub async fn get_or_compute<T, F>(
        &self,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T, ProviderError>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T, ProviderError>>,
    {
        if let Some(entry) = self.entries.get(key) {
            if entry.cached_at.elapsed() < entry.ttl {
                if let Ok(value) = serde_json::from_value(entry.value.clone()) {
                    return Ok(value);
                }
            }
        }

        let computed = compute.await?;
        let value = serde_json::to_value(&computed)
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.evict_oldest();
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                cached_at: Instant::now(),
                ttl,
            },
        );
        Ok(computed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().cached_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}
