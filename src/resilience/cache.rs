//! Two-tier response cache: an in-memory map over one durable key.
//!
//! Lookups try memory, then the durable tier (promoting hits to memory),
//! then fetch. Fetched responses land in both tiers. The durable tier is
//! capped; when it overflows the oldest entries are evicted in a block.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::store::{KvStore, get_json, set_json};
use crate::worker::Clock;

/// Durable key holding the cached responses.
pub const NETWORK_CACHE_KEY: &str = "networkCache";

/// Entries kept in the durable tier.
const DURABLE_CAP: usize = 50;

/// Oldest entries dropped when the durable tier overflows.
const EVICT_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub max_age: Duration,
    pub force_refresh: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(3600),
            force_refresh: false,
        }
    }
}

impl CacheOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }
}

pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    memory: RwLock<HashMap<String, CacheEntry>>,
    /// Serializes read-modify-write of the durable tier.
    durable_lock: Mutex<()>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            memory: RwLock::new(HashMap::new()),
            durable_lock: Mutex::new(()),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, max_age: Duration) -> bool {
        let age = self.clock.now() - entry.timestamp;
        age.to_std().map(|age| age < max_age).unwrap_or(true)
    }

    /// Cached response for `url`, fetching it when missing or stale.
    pub async fn get<F, Fut>(&self, url: &str, options: CacheOptions, fetch: F) -> anyhow::Result<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        if !options.force_refresh {
            if let Some(entry) = self.memory.read().await.get(url)
                && self.is_fresh(entry, options.max_age)
            {
                debug!(url, tier = "memory", "Response cache hit");
                return Ok(entry.data.clone());
            }

            match self.durable_entry(url).await {
                Ok(Some(entry)) if self.is_fresh(&entry, options.max_age) => {
                    debug!(url, tier = "durable", "Response cache hit");
                    let data = entry.data.clone();
                    self.memory.write().await.insert(url.to_string(), entry);
                    return Ok(data);
                }
                Ok(_) => {}
                Err(e) => warn!(url, error = %e, "Durable response cache unreadable"),
            }
        }

        debug!(url, force_refresh = options.force_refresh, "Response cache miss, fetching");
        let data = fetch().await?;
        self.insert(url, data.clone()).await;
        Ok(data)
    }

    /// Store a response in both tiers. Durable failures are logged only.
    pub async fn insert(&self, url: &str, data: Value) {
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now(),
        };
        self.memory
            .write()
            .await
            .insert(url.to_string(), entry.clone());
        if let Err(e) = self.persist_entry(url, entry).await {
            warn!(url, error = %e, "Failed to persist cached response");
        }
    }

    async fn durable_entries(&self) -> Result<HashMap<String, CacheEntry>, StorageError> {
        Ok(get_json(self.store.as_ref(), NETWORK_CACHE_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn durable_entry(&self, url: &str) -> Result<Option<CacheEntry>, StorageError> {
        Ok(self.durable_entries().await?.remove(url))
    }

    async fn persist_entry(&self, url: &str, entry: CacheEntry) -> Result<(), StorageError> {
        let _guard = self.durable_lock.lock().await;
        let mut entries = self.durable_entries().await.unwrap_or_else(|e| {
            warn!(error = %e, "Durable response cache unreadable, starting fresh");
            HashMap::new()
        });
        entries.insert(url.to_string(), entry);

        if entries.len() > DURABLE_CAP {
            let mut by_age: Vec<(String, DateTime<Utc>)> = entries
                .iter()
                .map(|(k, v)| (k.clone(), v.timestamp))
                .collect();
            by_age.sort_by_key(|(_, ts)| *ts);
            for (key, _) in by_age.into_iter().take(EVICT_COUNT) {
                entries.remove(&key);
            }
            debug!(remaining = entries.len(), "Evicted oldest cached responses");
        }

        set_json(self.store.as_ref(), NETWORK_CACHE_KEY, &entries).await
    }

    /// Entries currently in the durable tier.
    pub async fn durable_len(&self) -> Result<usize, StorageError> {
        Ok(self.durable_entries().await?.len())
    }

    /// Empty both tiers.
    pub async fn clear(&self) -> Result<(), StorageError> {
        self.memory.write().await.clear();
        let _guard = self.durable_lock.lock().await;
        self.store.remove(NETWORK_CACHE_KEY).await
    }
}
