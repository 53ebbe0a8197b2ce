//! Bounded, TTL-expiring response cache.
//!
//! Entries are ordered by recency in an [`LruCache`] and bounded twice: by
//! count (`max_entries`) and by the summed size estimate of every entry
//! (`max_bytes`). Eviction pops least-recently-used entries until both budgets
//! hold. Expiry is absolute from insertion; reads refresh recency but never
//! extend lifetime.
//!
//! Timestamps come from [`tokio::time::Instant`], so a paused test clock drives
//! expiry deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::IdempotencyConfig;
use crate::http::{Headers, Response, StatusCode};
use crate::idempotency::CacheKey;

/// Fixed per-entry bookkeeping charge added to the payload size.
const ENTRY_OVERHEAD: usize = 64;

/// Header added to every replayed response.
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("entry of {size} bytes exceeds the cache budget of {max_bytes} bytes")]
    EntryTooLarge { size: usize, max_bytes: usize },
}

/// Immutable snapshot of a completed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
}

impl StoredResponse {
    pub fn new(status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Snapshots `response` as the handler produced it.
    pub fn capture(response: &Response) -> Self {
        Self::new(
            response.status(),
            response.headers().clone(),
            response.payload().clone(),
        )
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Rebuilds the response for a replay, tagged `X-Cache: HIT`.
    pub fn replay(&self) -> Response {
        let mut response = Response::new(self.status).body_bytes(self.body.clone());
        for (name, value) in self.headers.iter() {
            response.add_header(name, value);
        }
        response.headers_mut().set(CACHE_STATUS_HEADER, "HIT");
        response
    }

    /// Size estimate charged against the byte budget.
    fn weight(&self, key: &CacheKey) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        ENTRY_OVERHEAD + key.as_str().len() + headers + self.body.len()
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub bytes_in_use: usize,
}

struct CacheEntry {
    response: Arc<StoredResponse>,
    inserted_at: Instant,
    weight: usize,
}

struct CacheInner {
    lru: LruCache<CacheKey, CacheEntry>,
    bytes_in_use: usize,
}

impl CacheInner {
    fn pop(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.lru.pop(key)?;
        self.bytes_in_use = self.bytes_in_use.saturating_sub(entry.weight);
        Some(entry)
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Thread-safe response store shared by every request-handling task.
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    max_entries: usize,
    max_bytes: usize,
    counters: Counters,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize, max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::unbounded(),
                bytes_in_use: 0,
            }),
            ttl,
            max_entries,
            max_bytes,
            counters: Counters::default(),
        }
    }

    pub fn from_config(config: &IdempotencyConfig) -> Self {
        Self::new(config.ttl, config.max_entries, config.max_bytes)
    }

    /// Returns the live entry for `key`, marking it most recently used.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<StoredResponse>> {
        self.lookup(key, true)
    }

    /// Second lookup by a request that already missed once; a miss here is
    /// not counted again.
    pub(crate) fn recheck(&self, key: &CacheKey) -> Option<Arc<StoredResponse>> {
        self.lookup(key, false)
    }

    fn lookup(&self, key: &CacheKey, count_miss: bool) -> Option<Arc<StoredResponse>> {
        let mut guard = self.inner.lock();
        match guard.lru.get(key) {
            None => {
                if count_miss {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                }
                return None;
            }
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(&entry.response));
            }
            Some(_) => {}
        }

        guard.pop(key);
        self.counters.expirations.fetch_add(1, Ordering::Relaxed);
        if count_miss {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        trace!(%key, "expired entry purged on read");
        None
    }

    /// Inserts or overwrites the entry for `key` and restarts its TTL.
    ///
    /// # Errors
    ///
    /// [`CacheError::EntryTooLarge`] when the entry alone exceeds `max_bytes`;
    /// the cache is left unchanged apart from dropping any previous value.
    pub fn set(&self, key: CacheKey, response: StoredResponse) -> Result<(), CacheError> {
        let weight = response.weight(&key);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        inner.pop(&key);

        if weight > self.max_bytes {
            return Err(CacheError::EntryTooLarge {
                size: weight,
                max_bytes: self.max_bytes,
            });
        }

        inner.bytes_in_use += weight;
        inner.lru.push(
            key,
            CacheEntry {
                response: Arc::new(response),
                inserted_at: Instant::now(),
                weight,
            },
        );
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);

        let mut evicted = 0u64;
        while inner.lru.len() > self.max_entries || inner.bytes_in_use > self.max_bytes {
            match inner.lru.pop_lru() {
                Some((_, removed)) => {
                    inner.bytes_in_use = inner.bytes_in_use.saturating_sub(removed.weight);
                    evicted += 1;
                }
                None => break,
            }
        }
        if evicted > 0 {
            self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
            debug!(
                evicted,
                entries = inner.lru.len(),
                bytes = inner.bytes_in_use,
                "evicted least recently used responses"
            );
        }
        Ok(())
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.inner.lock().pop(key).is_some()
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut guard = self.inner.lock();
        let expired: Vec<CacheKey> = guard
            .lru
            .iter()
            .filter(|(_, entry)| entry.inserted_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            guard.pop(key);
        }
        self.counters
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock();
        guard.lru.clear();
        guard.bytes_in_use = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_in_use(&self) -> usize {
        self.inner.lock().bytes_in_use
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, bytes_in_use) = {
            let guard = self.inner.lock();
            (guard.lru.len(), guard.bytes_in_use)
        };
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries,
            bytes_in_use,
        }
    }
}
