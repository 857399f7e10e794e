//! Store wrappers for unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::store::traits::KvStore;

/// Counts writes, records every written value, and can fail or panic on demand.
pub struct FlakyStore {
    inner: Arc<dyn KvStore>,
    writes: AtomicUsize,
    fail_next: AtomicUsize,
    fail_reads: AtomicUsize,
    panic_next: AtomicUsize,
    history: Mutex<Vec<(String, Value)>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            writes: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            fail_reads: AtomicUsize::new(0),
            panic_next: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Make the next `n` write calls fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` read calls fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` write calls panic.
    pub fn panic_next_writes(&self, n: usize) {
        self.panic_next.store(n, Ordering::SeqCst);
    }

    /// Successful write calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every value successfully written, in order.
    pub async fn history(&self) -> Vec<(String, Value)> {
        self.history.lock().await.clone()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl KvStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if Self::take_failure(&self.fail_reads) {
            return Err(StorageError::Backend("injected read failure".into()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.set_many(&[(key.to_string(), value.clone())]).await
    }

    async fn set_many(&self, entries: &[(String, Value)]) -> Result<(), StorageError> {
        if Self::take_failure(&self.panic_next) {
            panic!("injected storage panic");
        }
        if Self::take_failure(&self.fail_next) {
            return Err(StorageError::Backend("injected storage failure".into()));
        }
        self.inner.set_many(entries).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.history.lock().await.extend(entries.iter().cloned());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.remove(key).await
    }

    async fn entries(&self) -> Result<BTreeMap<String, Value>, StorageError> {
        self.inner.entries().await
    }

    async fn bytes_in_use(&self) -> Result<u64, StorageError> {
        self.inner.bytes_in_use().await
    }

    fn quota_bytes(&self) -> u64 {
        self.inner.quota_bytes()
    }
}
