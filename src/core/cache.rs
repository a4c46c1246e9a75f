//! Key/value cache with TTL randomisation and stampede protection.
//!
//! Semantics:
//! - every `set` stores the value twice: once under the caller's key with a
//!   jittered TTL, and once as a "stale" copy with 5x that TTL;
//! - locks carry a UUID fencing token and are released only when the stored
//!   token still matches (compare-and-delete);
//! - `get_with_lock` is the cache-aside pattern: hit -> return, miss -> try
//!   the lock, double-check, fetch, populate; losers back off linearly and
//!   re-poll the cache, falling back to the stale copy.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const STALE_PREFIX: &str = "stale:";
const STALE_TTL_FACTOR: u32 = 5;

/// TTL preset: base duration plus a randomisation range.
///
/// The jitter prevents synchronous expiration waves when many keys are
/// populated in the same burst.
#[derive(Debug, Clone, Copy)]
pub struct CacheTtl {
    pub base_secs: u64,
    pub jitter_secs: u64,
}

impl CacheTtl {
    pub const REALTIME_QUOTE: CacheTtl = CacheTtl { base_secs: 30, jitter_secs: 30 };
    pub const COMPANY_INFO: CacheTtl = CacheTtl { base_secs: 3600, jitter_secs: 600 };
    pub const FINANCIAL_DATA: CacheTtl = CacheTtl { base_secs: 86400, jitter_secs: 3600 };
    pub const SEARCH: CacheTtl = CacheTtl { base_secs: 600, jitter_secs: 60 };

    /// Sample an effective TTL: `base + uniform(0, jitter)`.
    pub fn sample(&self) -> Duration {
        let extra = if self.jitter_secs == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_secs)
        };
        Duration::from_secs(self.base_secs + extra)
    }
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

struct LockEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    locks: HashMap<String, LockEntry>,
}

/// Process-wide cache shared by the HTTP layer and the pipeline workers.
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<Mutex<Inner>>,
    lock_timeout: Duration,
    lock_retry_interval: Duration,
}

impl Default for CacheService {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            lock_timeout: Duration::from_secs(10),
            lock_retry_interval: Duration::from_millis(100),
        }
    }

    pub fn get(&self, key: &str, allow_stale: bool) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if let Some(entry) = inner.entries.get(key) {
            if entry.expires_at > now {
                debug!(key, "cache hit");
                return Some(entry.value.clone());
            }
            inner.entries.remove(key);
        }

        if allow_stale {
            let stale_key = format!("{}{}", STALE_PREFIX, key);
            if let Some(entry) = inner.entries.get(&stale_key) {
                if entry.expires_at > now {
                    debug!(key, "returning stale copy");
                    return Some(entry.value.clone());
                }
                inner.entries.remove(&stale_key);
            }
        }

        None
    }

    /// Store a value with jittered TTL plus a 5x-TTL stale copy.
    /// Returns the effective TTL that was applied.
    pub fn set(&self, key: &str, value: serde_json::Value, ttl: CacheTtl) -> Duration {
        let effective = ttl.sample();
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key.to_string(),
            Entry { value: value.clone(), expires_at: now + effective },
        );
        inner.entries.insert(
            format!("{}{}", STALE_PREFIX, key),
            Entry { value, expires_at: now + effective * STALE_TTL_FACTOR },
        );
        effective
    }

    pub fn delete(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.entries.remove(key);
        inner.entries.remove(&format!("{}{}", STALE_PREFIX, key));
    }

    /// Fetch several keys at once; misses are simply absent from the map.
    pub fn get_many(&self, keys: &[&str]) -> HashMap<String, serde_json::Value> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key, false) {
                out.insert(key.to_string(), value);
            }
        }
        out
    }

    /// Drop every entry whose key starts with `prefix`. Returns the count.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|k, _| !(k.starts_with(prefix) || k.starts_with(&format!("{}{}", STALE_PREFIX, prefix))));
        before - inner.entries.len()
    }

    /// Try to take the key-scoped lock. Returns the fencing token on success.
    pub fn acquire_lock(&self, key: &str, timeout: Option<Duration>) -> Option<String> {
        let timeout = timeout.unwrap_or(self.lock_timeout);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.locks.get(key) {
            if existing.expires_at > now {
                return None;
            }
        }

        let token = Uuid::new_v4().simple().to_string();
        inner.locks.insert(
            key.to_string(),
            LockEntry { token: token.clone(), expires_at: now + timeout },
        );
        debug!(key, "lock acquired");
        Some(token)
    }

    /// Release a lock only if the fencing token still matches.
    pub fn release_lock(&self, key: &str, token: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.locks.get(key) {
            Some(existing) if existing.token == token => {
                inner.locks.remove(key);
                true
            }
            Some(_) => {
                warn!(key, "lock already expired or stolen");
                false
            }
            None => false,
        }
    }

    /// Cache-aside with stampede protection.
    ///
    /// On fetch error the caller receives the stale copy when one exists;
    /// otherwise the error propagates.
    pub async fn get_with_lock<F, Fut>(
        &self,
        key: &str,
        ttl: CacheTtl,
        fetch: F,
        max_retries: u32,
    ) -> anyhow::Result<Option<serde_json::Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<serde_json::Value>>,
    {
        if let Some(cached) = self.get(key, false) {
            return Ok(Some(cached));
        }

        let mut fetch = Some(fetch);

        for attempt in 0..max_retries {
            if let Some(token) = self.acquire_lock(key, None) {
                // Double-check after winning the lock: the previous holder
                // may have populated the cache between our miss and now.
                if let Some(cached) = self.get(key, false) {
                    self.release_lock(key, token.as_str());
                    return Ok(Some(cached));
                }

                let fetch_fn = match fetch.take() {
                    Some(f) => f,
                    None => break,
                };
                let result = fetch_fn().await;
                let outcome = match result {
                    Ok(value) => {
                        self.set(key, value.clone(), ttl);
                        Ok(Some(value))
                    }
                    Err(e) => {
                        warn!(key, error = %e, "fetch failed, trying stale copy");
                        match self.get(key, true) {
                            Some(stale) => Ok(Some(stale)),
                            None => Err(e),
                        }
                    }
                };
                self.release_lock(key, token.as_str());
                return outcome;
            }

            // Lock held elsewhere: linear backoff, then re-poll the cache.
            tokio::time::sleep(self.lock_retry_interval * (attempt + 1)).await;
            if let Some(cached) = self.get(key, false) {
                return Ok(Some(cached));
            }
        }

        warn!(key, "lock contention exhausted, returning stale copy");
        Ok(self.get(key, true))
    }
}
