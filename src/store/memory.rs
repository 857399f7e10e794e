//! In-memory `KvStore` with the same quota semantics as the durable backend.
//!
//! Used for tests and for hosts that provide durability elsewhere.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::DEFAULT_QUOTA_BYTES;
use crate::error::StorageError;
use crate::store::traits::{KvStore, entry_size};

/// Quota-capped key-value store held in memory.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
    quota_bytes: u64,
}

impl MemoryStore {
    /// Create a store with the default 10 MiB quota.
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }

    /// Create a store with a custom byte quota.
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota_bytes,
        }
    }

    fn used(entries: &HashMap<String, Value>) -> u64 {
        entries.iter().map(|(k, v)| entry_size(k, v)).sum()
    }

    /// Bytes the map would use after replacing `updates`.
    fn projected(entries: &HashMap<String, Value>, updates: &[(String, Value)]) -> u64 {
        let mut total = Self::used(entries);
        for (key, value) in updates {
            if let Some(old) = entries.get(key) {
                total -= entry_size(key, old);
            }
            total += entry_size(key, value);
        }
        total
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.set_many(&[(key.to_string(), value.clone())]).await
    }

    async fn set_many(&self, updates: &[(String, Value)]) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        let needed = Self::projected(&entries, updates);
        if needed > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                needed,
                quota: self.quota_bytes,
            });
        }
        for (key, value) in updates {
            entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn bytes_in_use(&self) -> Result<u64, StorageError> {
        Ok(Self::used(&*self.entries.read().await))
    }

    fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::traits::{get_json, set_json, storage_usage};
    use serde_json::json;

    #[tokio::test]
    async fn set_get_remove() {
        let store = MemoryStore::new();
        assert!(store.get("a").await.unwrap().is_none());

        store.set("a", &json!({"x": 1})).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));

        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        // Removing again is fine
        store.remove("a").await.unwrap();
    }

    #[tokio::test]
    async fn quota_rejects_oversized_write_and_keeps_old_value() {
        let store = MemoryStore::with_quota(32);
        store.set("k", &json!("small")).await.unwrap();

        let big = json!("x".repeat(64));
        let err = store.set("k", &big).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 32, .. }));
        assert_eq!(store.get("k").await.unwrap(), Some(json!("small")));
    }

    #[tokio::test]
    async fn overwrite_is_charged_once() {
        let store = MemoryStore::with_quota(40);
        for i in 0..10 {
            store.set("counter", &json!(i)).await.unwrap();
        }
        assert_eq!(store.bytes_in_use().await.unwrap(), entry_size("counter", &json!(9)));
    }

    #[tokio::test]
    async fn set_many_is_all_or_nothing() {
        let store = MemoryStore::with_quota(20);
        let updates = vec![
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!("y".repeat(40))),
        ];
        assert!(store.set_many(&updates).await.is_err());
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn typed_helpers_and_usage() {
        let store = MemoryStore::with_quota(1000);
        set_json(&store, "list", &vec![1, 2, 3]).await.unwrap();
        let list: Vec<u32> = get_json(&store, "list").await.unwrap().unwrap();
        assert_eq!(list, vec![1, 2, 3]);

        let usage = storage_usage(&store).await.unwrap();
        assert_eq!(usage.quota_bytes, 1000);
        assert_eq!(usage.bytes_used, entry_size("list", &json!([1, 2, 3])));
        assert!(!usage.near_quota);
    }

    #[tokio::test]
    async fn entries_lists_everything() {
        let store = MemoryStore::new();
        store.set("b", &json!(2)).await.unwrap();
        store.set("a", &json!(1)).await.unwrap();
        let all = store.entries().await.unwrap();
        assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
