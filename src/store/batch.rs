//! Debounced multi-key writes.
//!
//! Writes are collected for a short window and land in one `set_many` call.
//! A failed flush puts its entries back (unless a newer write replaced them)
//! and tries again on the next cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::diagnostics::{ErrorBuffer, ErrorSink, spawn_recorded};
use crate::error::StorageError;
use crate::store::traits::KvStore;

/// Default window during which writes are coalesced.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(500);

#[derive(Default)]
struct BatchState {
    pending: HashMap<String, Value>,
    timer: Option<JoinHandle<()>>,
}

/// Coalesces key writes into periodic batched flushes.
pub struct WriteBatch {
    store: Arc<dyn KvStore>,
    window: Duration,
    state: Mutex<BatchState>,
    errors: ErrorSink,
}

impl WriteBatch {
    /// Create a batch writer over `store`.
    pub fn new(store: Arc<dyn KvStore>) -> Arc<Self> {
        Self::with_window(store, DEFAULT_BATCH_WINDOW)
    }

    /// Create a batch writer with a custom coalescing window.
    pub fn with_window(store: Arc<dyn KvStore>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            window,
            state: Mutex::new(BatchState::default()),
            errors: ErrorSink::default(),
        })
    }

    /// Record panics in the background flush into `errors`.
    pub fn set_error_buffer(&self, errors: Arc<ErrorBuffer>) -> bool {
        self.errors.attach(errors)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a write. The first write in a quiet period arms the flush timer.
    pub fn set(self: &Arc<Self>, key: impl Into<String>, value: Value) {
        let mut state = self.state();
        state.pending.insert(key.into(), value);
        self.arm(&mut state);
    }

    fn arm(self: &Arc<Self>, state: &mut BatchState) {
        if state.timer.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let window = self.window;
        state.timer = Some(spawn_recorded(self.errors.get(), "write-batch", async move {
            tokio::time::sleep(window).await;
            this.state().timer = None;
            if let Err(e) = this.write_pending().await {
                warn!(error = %e, "Batched write failed, will retry next cycle");
            }
        }));
    }

    /// Flush now, cancelling the pending timer.
    pub async fn flush(self: &Arc<Self>) -> Result<(), StorageError> {
        if let Some(timer) = self.state().timer.take() {
            timer.abort();
        }
        self.write_pending().await
    }

    async fn write_pending(self: &Arc<Self>) -> Result<(), StorageError> {
        let to_save: Vec<(String, Value)> = self.state().pending.drain().collect();
        if to_save.is_empty() {
            return Ok(());
        }

        match self.store.set_many(&to_save).await {
            Ok(()) => {
                debug!(keys = to_save.len(), "Batched write flushed");
                Ok(())
            }
            Err(e) => {
                let mut state = self.state();
                for (key, value) in to_save {
                    state.pending.entry(key).or_insert(value);
                }
                self.arm(&mut state);
                Err(e)
            }
        }
    }

    /// Read keys, preferring values that are still waiting to be flushed.
    pub async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, StorageError> {
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        {
            let state = self.state();
            for key in keys {
                match state.pending.get(*key) {
                    Some(value) => {
                        out.insert(key.to_string(), value.clone());
                    }
                    None => missing.push(*key),
                }
            }
        }
        for key in missing {
            if let Some(value) = self.store.get(key).await? {
                out.insert(key.to_string(), value);
            }
        }
        Ok(out)
    }

    /// Number of writes waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::store::test_support::FlakyStore;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn writes_coalesce_into_one_flush() {
        let inner = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        let batch = WriteBatch::new(flaky.clone());

        batch.set("a", json!(1));
        batch.set("b", json!(2));
        batch.set("a", json!(3));
        assert_eq!(flaky.write_count(), 0);

        tokio::time::sleep(DEFAULT_BATCH_WINDOW + Duration::from_millis(10)).await;

        assert_eq!(flaky.write_count(), 1);
        assert_eq!(inner.get("a").await.unwrap(), Some(json!(3)));
        assert_eq!(inner.get("b").await.unwrap(), Some(json!(2)));
        assert_eq!(batch.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn get_prefers_pending_values() {
        let inner = Arc::new(MemoryStore::new());
        inner.set("a", &json!("stored")).await.unwrap();
        inner.set("b", &json!("stored")).await.unwrap();
        let batch = WriteBatch::new(inner.clone());

        batch.set("a", json!("pending"));
        let got = batch.get(&["a", "b", "c"]).await.unwrap();
        assert_eq!(got.get("a"), Some(&json!("pending")));
        assert_eq!(got.get("b"), Some(&json!("stored")));
        assert!(!got.contains_key("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_requeues_without_clobbering_newer_writes() {
        let inner = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        let batch = WriteBatch::new(flaky.clone());

        flaky.fail_next_writes(1);
        batch.set("a", json!("old"));
        batch.set("b", json!("kept"));
        assert!(batch.flush().await.is_err());
        assert_eq!(batch.pending_len(), 2);

        batch.set("a", json!("new"));
        tokio::time::sleep(DEFAULT_BATCH_WINDOW + Duration::from_millis(10)).await;

        assert_eq!(inner.get("a").await.unwrap(), Some(json!("new")));
        assert_eq!(inner.get("b").await.unwrap(), Some(json!("kept")));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_background_flush_is_recorded() {
        let inner = Arc::new(MemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(inner.clone()));
        let errors = Arc::new(ErrorBuffer::new(Arc::new(MemoryStore::new()), 10));
        let batch = WriteBatch::new(flaky.clone());
        assert!(batch.set_error_buffer(errors.clone()));

        flaky.panic_next_writes(1);
        batch.set("a", json!(1));

        let records = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let records = errors.get_error_buffer().await.unwrap();
                if !records.is_empty() {
                    break records;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(records[0].context_tag, "write-batch");
        assert!(records[0].message.contains("injected storage panic"));
    }
}
