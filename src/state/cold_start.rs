//! Startup data cached in the durable store.
//!
//! Expensive startup data is computed once (at install, or on the first
//! miss) and served from the store on every later worker wake.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::store::{KvStore, get_json, set_json};

/// Default durable key for cached startup data.
pub const DEFAULT_COLD_START_KEY: &str = "cachedStartupData";

pub struct ColdStartCache {
    store: Arc<dyn KvStore>,
    key: String,
}

impl ColdStartCache {
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Compute and store the data unconditionally. Run on install/update.
    pub async fn prime<T, F, Fut>(&self, compute: F) -> anyhow::Result<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let data = compute().await?;
        set_json(self.store.as_ref(), &self.key, &data).await?;
        info!(key = %self.key, "Cold-start cache primed");
        Ok(data)
    }

    /// Return the stored copy, computing and storing it on a miss.
    ///
    /// A stored `null` counts as a miss.
    pub async fn get_or_compute<T, F, Fut>(&self, compute: F) -> anyhow::Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match self.store.get(&self.key).await? {
            Some(value) if !value.is_null() => {
                debug!(key = %self.key, "Cold-start cache hit");
                Ok(serde_json::from_value(value)?)
            }
            _ => {
                debug!(key = %self.key, "Cold-start cache miss, computing");
                self.prime(compute).await
            }
        }
    }

    /// Drop the stored copy so the next read recomputes.
    pub async fn invalidate(&self) -> anyhow::Result<()> {
        self.store.remove(&self.key).await?;
        Ok(())
    }

    /// Stored copy without computing.
    pub async fn peek<T: DeserializeOwned>(&self) -> anyhow::Result<Option<T>> {
        Ok(get_json(self.store.as_ref(), &self.key).await?)
    }
}
