//! Cache store contract and the per-fetcher publisher.
//!
//! The engine only needs batched get and set with a TTL. Keys are
//! `"{fetcher}:id:{identifier}"`; values are raw upstream payloads.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use serde::Serialize;
use tokio::time::Instant;

use crate::errors::Result;

/// How much of a requested key set was cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// Everything was found.
    Full,
    /// Some, not all.
    Partial,
    /// Nothing was found.
    Miss,
}

impl CacheStatus {
    pub fn classify(found: usize, missing: usize) -> Self {
        match (found, missing) {
            (_, 0) => Self::Full,
            (0, _) => Self::Miss,
            _ => Self::Partial,
        }
    }
}

/// Result of a batched cache read.
#[derive(Clone, Debug, Default)]
pub struct CacheLookup {
    pub found: HashMap<String, Bytes>,
    pub missing: Vec<String>,
}

/// Batched key/value store with per-write TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, keys: &[String]) -> Result<CacheLookup>;
    async fn set(&self, data: HashMap<String, Bytes>, ttl: Duration) -> Result<()>;
}

#[derive(Clone, Debug)]
struct CacheEntry {
    value: Bytes,
    expires_at: Instant,
}

/// In-process [`CacheStore`] backed by a concurrent map.
///
/// Expired entries are dropped lazily on read or by
/// [`purge_expired`](Self::purge_expired).
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, keys: &[String]) -> Result<CacheLookup> {
        let now = Instant::now();
        let mut lookup = CacheLookup::default();
        let mut expired = Vec::new();

        for key in keys {
            let hit = self.entries.get(key).and_then(|entry| {
                if entry.expires_at > now {
                    Some(entry.value.clone())
                } else {
                    None
                }
            });
            match hit {
                Some(value) => {
                    lookup.found.insert(key.clone(), value);
                }
                None => {
                    if self.entries.contains_key(key) {
                        expired.push(key.clone());
                    }
                    lookup.missing.push(key.clone());
                }
            }
        }

        // Shard guards are released above; removal here cannot deadlock.
        for key in expired {
            self.entries
                .remove_if(&key, |_, entry| entry.expires_at <= now);
        }

        Ok(lookup)
    }

    async fn set(&self, data: HashMap<String, Bytes>, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        for (key, value) in data {
            self.entries.insert(key, CacheEntry { value, expires_at });
        }
        Ok(())
    }
}

/// Cache key for `id` in namespace `namespace`.
pub fn cache_key(namespace: &str, id: &str) -> String {
    format!("{}:id:{}", namespace, id)
}

/// Cache read results keyed by raw identifier.
#[derive(Clone, Debug)]
pub struct Lookup {
    pub found: HashMap<String, Bytes>,
    pub missing: Vec<String>,
    pub status: CacheStatus,
}

/// Writes and reads one fetcher's slice of the cache.
#[derive(Clone)]
pub struct CachePublisher {
    namespace: String,
    ttl: Duration,
    store: Arc<dyn CacheStore>,
}

impl CachePublisher {
    pub fn new(namespace: impl Into<String>, ttl: Duration, store: Arc<dyn CacheStore>) -> Self {
        Self {
            namespace: namespace.into(),
            ttl,
            store,
        }
    }

    /// Write `data` in a single batched set with the fetcher TTL.
    pub async fn store(&self, data: &HashMap<String, Bytes>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let keyed: HashMap<String, Bytes> = data
            .iter()
            .map(|(id, value)| (cache_key(&self.namespace, id), value.clone()))
            .collect();
        debug!("Caching {} item(s) under '{}'", keyed.len(), self.namespace);
        self.store.set(keyed, self.ttl).await
    }

    /// Read `ids` back, reporting what was found and what is missing.
    ///
    /// Repeated ids are looked up once; `missing` keeps first-seen order.
    pub async fn lookup(&self, ids: &[String]) -> Result<Lookup> {
        let mut seen = HashSet::with_capacity(ids.len());
        let ids: Vec<&String> = ids.iter().filter(|id| seen.insert(id.as_str())).collect();
        let keys: Vec<String> = ids.iter().map(|id| cache_key(&self.namespace, id)).collect();
        let mut raw = self.store.get(&keys).await?;

        let mut found = HashMap::with_capacity(raw.found.len());
        let mut missing = Vec::new();
        for (id, key) in ids.into_iter().zip(&keys) {
            match raw.found.remove(key) {
                Some(value) => {
                    found.insert(id.clone(), value);
                }
                None => missing.push(id.clone()),
            }
        }

        let status = CacheStatus::classify(found.len(), missing.len());
        Ok(Lookup {
            found,
            missing,
            status,
        })
    }

    /// Return the cached payload for `id`, or run `loader`, cache what it
    /// returns and report a miss.
    pub async fn get_or_load<F, Fut>(&self, id: &str, loader: F) -> Result<(Bytes, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let ids = [id.to_string()];
        let lookup = self.lookup(&ids).await?;
        if let Some(value) = lookup.found.get(id) {
            return Ok((value.clone(), CacheStatus::Full));
        }

        let value = loader().await?;
        let mut data = HashMap::with_capacity(1);
        data.insert(id.to_string(), value.clone());
        self.store(&data).await?;
        Ok((value, CacheStatus::Miss))
    }
}
