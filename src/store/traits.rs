//! `KvStore` trait: the single durability primitive.
//!
//! Every other component keeps a rebuildable in-memory view and writes
//! through one key of this store. Values are plain JSON trees.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StorageError;

/// Fraction of the quota above which a store counts as nearly full.
const NEAR_QUOTA_RATIO: f64 = 0.8;

/// Asynchronous, capped key-value store that survives worker termination.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write a single key, replacing any previous value.
    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError>;

    /// Write several keys in one operation. Either all land or none do.
    async fn set_many(&self, entries: &[(String, Value)]) -> Result<(), StorageError>;

    /// Delete a key. Missing keys are not an error.
    async fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List every stored entry.
    async fn entries(&self) -> Result<BTreeMap<String, Value>, StorageError>;

    /// Bytes currently charged against the quota.
    async fn bytes_in_use(&self) -> Result<u64, StorageError>;

    /// The byte quota this store enforces.
    fn quota_bytes(&self) -> u64;

    /// List every stored key.
    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries().await?.into_keys().collect())
    }
}

/// Bytes charged for one entry: key plus serialized value.
pub(crate) fn entry_size(key: &str, value: &Value) -> u64 {
    let value_len = serde_json::to_string(value).map(|s| s.len()).unwrap_or(0);
    (key.len() + value_len) as u64
}

/// Read a key and decode it into `T`.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Encode `value` and write it under `key`.
pub async fn set_json<T: Serialize + ?Sized>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let value = serde_json::to_value(value)?;
    store.set(key, &value).await
}

/// Snapshot of how much of the quota is used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageUsage {
    pub bytes_used: u64,
    pub quota_bytes: u64,
    pub percent_used: f64,
    pub near_quota: bool,
}

/// Report quota usage for a store.
pub async fn storage_usage(store: &dyn KvStore) -> Result<StorageUsage, StorageError> {
    let bytes_used = store.bytes_in_use().await?;
    let quota_bytes = store.quota_bytes();
    let ratio = if quota_bytes == 0 {
        1.0
    } else {
        bytes_used as f64 / quota_bytes as f64
    };
    Ok(StorageUsage {
        bytes_used,
        quota_bytes,
        percent_used: (ratio * 1000.0).round() / 10.0,
        near_quota: ratio > NEAR_QUOTA_RATIO,
    })
}
