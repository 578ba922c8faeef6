//! Read-through TTL cache shared by every resource reconciler.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;

/// How a read may be served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheReadType {
    /// Serve a fresh entry, refetch an expired one.
    Default,
    /// Serve any entry, even an expired one.
    AllowUnsafe,
    /// Always refetch.
    ForceRefresh,
}

struct CacheEntry<T> {
    value: Option<T>,
    fetched_at: Instant,
}

/// Cache keyed by resource name. `None` records a confirmed not-found.
pub struct ResourceCache<T> {
    kind: &'static str,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> ResourceCache<T> {
    pub fn new(kind: &'static str, ttl: Duration) -> Self {
        Self {
            kind,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached value for `key`, calling `fetch` when the read type demands it.
    pub async fn get<F, Fut>(&self, key: &str, read: CacheReadType, fetch: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let key = key.to_ascii_lowercase();
        if read != CacheReadType::ForceRefresh {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(&key) {
                if read == CacheReadType::AllowUnsafe || entry.fetched_at.elapsed() < self.ttl {
                    trace!(kind = self.kind, key = %key, "cache hit");
                    return Ok(entry.value.clone());
                }
            }
        }

        let value = fetch().await?;
        self.entries.lock().insert(
            key,
            CacheEntry {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    pub async fn get_force_refresh<F, Fut>(&self, key: &str, fetch: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        self.get(key, CacheReadType::ForceRefresh, fetch).await
    }

    /// Store a value directly, e.g. after a successful list.
    pub fn set(&self, key: &str, value: Option<T>) {
        self.entries.lock().insert(
            key.to_ascii_lowercase(),
            CacheEntry {
                value,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        trace!(kind = self.kind, key = %key, "cache invalidate");
        self.entries.lock().remove(&key.to_ascii_lowercase());
    }

    pub fn invalidate_all(&self) {
        self.entries.lock().clear();
    }
}
