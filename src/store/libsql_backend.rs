//! libSQL backend: durable `KvStore` implementation.
//!
//! A single `kv` table holds JSON-encoded values. Supports local file and
//! in-memory databases. All statements share one connection, so a write
//! holds the access lock exclusively for its whole transaction and reads
//! take the shared side. Readers never observe a write that the quota check
//! later rolls back.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::DEFAULT_QUOTA_BYTES;
use crate::error::StorageError;
use crate::store::migrations;
use crate::store::traits::{KvStore, entry_size};

/// libSQL-backed durable store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    access: RwLock<()>,
    quota_bytes: u64,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, quota_bytes: u64) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Backend(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, quota_bytes).await?;
        info!(path = %path.display(), quota_bytes, "Durable store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StorageError::Backend(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, DEFAULT_QUOTA_BYTES).await
    }

    async fn from_database(db: LibSqlDatabase, quota_bytes: u64) -> Result<Self, StorageError> {
        let conn = db
            .connect()
            .map_err(|e| StorageError::Backend(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            access: RwLock::new(()),
            quota_bytes,
        })
    }

    async fn used(conn: &Connection) -> Result<u64, StorageError> {
        let mut rows = conn
            .query("SELECT COALESCE(SUM(size), 0) FROM kv", ())
            .await
            .map_err(|e| StorageError::Query(format!("Failed to sum entry sizes: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| StorageError::Query(format!("Failed to read entry sizes: {e}")))?;
        match row {
            Some(row) => {
                let used: i64 = row.get(0).unwrap_or(0);
                Ok(used.max(0) as u64)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl KvStore for LibSqlStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let _guard = self.access.read().await;
        let mut rows = self
            .conn
            .query("SELECT value FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| StorageError::Query(format!("Failed to read key '{key}': {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| StorageError::Query(format!("Failed to read key '{key}': {e}")))?;

        match row {
            Some(row) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| StorageError::Query(format!("Bad value column: {e}")))?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.set_many(&[(key.to_string(), value.clone())]).await
    }

    async fn set_many(&self, entries: &[(String, Value)]) -> Result<(), StorageError> {
        let _guard = self.access.write().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| StorageError::Query(format!("Failed to begin transaction: {e}")))?;

        let now = Utc::now().to_rfc3339();
        for (key, value) in entries {
            let encoded = serde_json::to_string(value)?;
            let size = entry_size(key, value) as i64;
            tx.execute(
                "INSERT INTO kv (key, value, updated_at, size) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at,
                    size = excluded.size",
                params![key.as_str(), encoded, now.as_str(), size],
            )
            .await
            .map_err(|e| StorageError::Query(format!("Failed to write key '{key}': {e}")))?;
        }

        let needed = Self::used(&tx).await?;
        if needed > self.quota_bytes {
            tx.rollback()
                .await
                .map_err(|e| StorageError::Query(format!("Failed to roll back: {e}")))?;
            return Err(StorageError::QuotaExceeded {
                needed,
                quota: self.quota_bytes,
            });
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::Query(format!("Failed to commit: {e}")))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.access.write().await;
        self.conn
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .await
            .map_err(|e| StorageError::Query(format!("Failed to remove key '{key}': {e}")))?;
        Ok(())
    }

    async fn entries(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        let _guard = self.access.read().await;
        let mut rows = self
            .conn
            .query("SELECT key, value FROM kv ORDER BY key", ())
            .await
            .map_err(|e| StorageError::Query(format!("Failed to list entries: {e}")))?;

        let mut out = BTreeMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StorageError::Query(format!("Failed to list entries: {e}")))?
        {
            let key: String = row
                .get(0)
                .map_err(|e| StorageError::Query(format!("Bad key column: {e}")))?;
            let raw: String = row
                .get(1)
                .map_err(|e| StorageError::Query(format!("Bad value column: {e}")))?;
            out.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(out)
    }

    async fn bytes_in_use(&self) -> Result<u64, StorageError> {
        let _guard = self.access.read().await;
        Self::used(&self.conn).await
    }

    fn quota_bytes(&self) -> u64 {
        self.quota_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn set_get_roundtrip_preserves_json() {
        let store = test_store().await;
        let value = json!({"settings": {"theme": "dark"}, "n": 1.5, "list": [1, "two", null]});
        store.set("appState", &value).await.unwrap();
        assert_eq!(store.get("appState").await.unwrap(), Some(value));
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let store = test_store().await;
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_replaces_value() {
        let store = test_store().await;
        store.set("k", &json!(1)).await.unwrap();
        store.set("k", &json!(2)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!(2)));
        assert_eq!(store.keys().await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn remove_and_entries() {
        let store = test_store().await;
        store
            .set_many(&[("a".into(), json!(1)), ("b".into(), json!(2))])
            .await
            .unwrap();
        store.remove("a").await.unwrap();
        let all = store.entries().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn quota_exceeded_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LibSqlStore::new_local(&tmp.path().join("kv.db"), 32)
            .await
            .unwrap();
        store.set("k", &json!("small")).await.unwrap();

        let err = store.set("k", &json!("x".repeat(64))).await.unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { quota: 32, .. }));
        assert_eq!(store.get("k").await.unwrap(), Some(json!("small")));
        assert_eq!(
            store.bytes_in_use().await.unwrap(),
            entry_size("k", &json!("small"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readers_never_see_rejected_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(
            LibSqlStore::new_local(&tmp.path().join("kv.db"), 4000)
                .await
                .unwrap(),
        );
        store.set("k", &json!("committed")).await.unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let mut reads = 0u32;
                loop {
                    let seen = store.get("k").await.unwrap();
                    assert_eq!(seen, Some(json!("committed")));
                    let used = store.bytes_in_use().await.unwrap();
                    assert!(used <= 4000);
                    reads += 1;
                    if stop.load(std::sync::atomic::Ordering::SeqCst) {
                        break reads;
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut rejected = 0;
        for i in 0..100 {
            let result = store
                .set_many(&[
                    ("k".into(), json!(format!("big-{i}"))),
                    ("pad".into(), json!("x".repeat(5000))),
                ])
                .await;
            if matches!(result, Err(StorageError::QuotaExceeded { .. })) {
                rejected += 1;
            }
        }
        stop.store(true, std::sync::atomic::Ordering::SeqCst);

        let reads = reader.await.unwrap();
        assert_eq!(rejected, 100);
        assert!(reads > 0);
        assert!(store.get("pad").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("kv.db");
        {
            let store = LibSqlStore::new_local(&path, DEFAULT_QUOTA_BYTES)
                .await
                .unwrap();
            store.set("pendingTasks", &json!([{"type": "sync"}])).await.unwrap();
        }
        let reopened = LibSqlStore::new_local(&path, DEFAULT_QUOTA_BYTES)
            .await
            .unwrap();
        assert_eq!(
            reopened.get("pendingTasks").await.unwrap(),
            Some(json!([{"type": "sync"}]))
        );
    }
}
