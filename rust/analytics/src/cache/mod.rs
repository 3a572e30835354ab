//! Cache-aside orchestration over an optional [`CacheStore`].
//!
//! Store failures degrade to recomputation and are only logged; callers never see them.

mod fingerprint;
mod store;

pub use fingerprint::{canonical_json, fingerprint};
pub use store::{CacheError, CacheStore, MemoryStore, RedisStore, StoreInfo};

use serde::{de::DeserializeOwned, Serialize};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

pub const QUERY_PREFIX: &str = "analytics:query";
pub const KPI_PREFIX: &str = "analytics:kpis";
pub const COMPARE_PREFIX: &str = "analytics:compare";
pub const DIMENSIONS_PREFIX: &str = "analytics:dimensions";
pub const DEFAULT_CLEAR_PATTERN: &str = "analytics:*";

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStats {
    pub connected: bool,
    pub hit_rate: f64,
    pub hits: u64,
    pub misses: u64,
    pub key_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used: Option<String>,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[derive(Clone)]
pub struct QueryCache {
    store: Option<Arc<dyn CacheStore>>,
    default_ttl: Duration,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("enabled", &self.store.is_some())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl QueryCache {
    pub fn new(store: Option<Arc<dyn CacheStore>>, default_ttl: Duration) -> Self {
        Self {
            store,
            default_ttl,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(300))
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Returns the cached value for `payload` or computes and stores it.
    /// The flag is `true` only when the value came from the store.
    pub async fn get_or_compute<P, T, E, F, Fut>(
        &self,
        prefix: &str,
        payload: &P,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<(T, bool), E>
    where
        P: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(store) = &self.store else {
            return compute().await.map(|value| (value, false));
        };

        let key = match fingerprint(prefix, payload) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, prefix, "cache: payload could not be fingerprinted");
                return compute().await.map(|value| (value, false));
            }
        };

        match store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    self.counters.hit();
                    debug!(key = %key, "cache hit");
                    return Ok((value, true));
                }
                Err(err) => warn!(key = %key, error = %err, "cache: discarding undecodable entry"),
            },
            Ok(None) => {}
            Err(err) => warn!(key = %key, error = %err, "cache: get failed"),
        }

        self.counters.miss();
        debug!(key = %key, "cache miss");
        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(encoded) => {
                let ttl = ttl.unwrap_or(self.default_ttl);
                if let Err(err) = store.set(&key, encoded, ttl).await {
                    warn!(key = %key, error = %err, "cache: set failed");
                }
            }
            Err(err) => warn!(key = %key, error = %err, "cache: result could not be encoded"),
        }

        Ok((value, false))
    }

    /// Best-effort removal of every key matching `pattern`.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.delete_matching(pattern).await {
            Ok(deleted) => {
                debug!(pattern, deleted, "cache invalidated");
                deleted
            }
            Err(err) => {
                warn!(pattern, error = %err, "cache: pattern invalidation failed");
                0
            }
        }
    }

    pub async fn invalidate_one<P: Serialize + ?Sized>(&self, prefix: &str, payload: &P) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let key = match fingerprint(prefix, payload) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, prefix, "cache: payload could not be fingerprinted");
                return false;
            }
        };
        match store.delete(&key).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(key = %key, error = %err, "cache: delete failed");
                false
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let (hits, misses) = self.counters.snapshot();
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64 * 10_000.0).round() / 100.0
        };

        let (connected, info) = match &self.store {
            None => (false, StoreInfo::default()),
            Some(store) => match store.info().await {
                Ok(info) => (true, info),
                Err(err) => {
                    warn!(error = %err, "cache: stats unavailable");
                    (false, StoreInfo::default())
                }
            },
        };

        CacheStats {
            connected,
            hit_rate,
            hits,
            misses,
            key_count: info.key_count,
            memory_used: info.memory_used,
        }
    }
}
