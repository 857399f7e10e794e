//! Capped, persisted error log.
//!
//! Records live under one durable key as an ordered list, oldest first.
//! Recording must never fail the caller: storage problems while recording
//! are logged and swallowed.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::diagnostics::classify::{ClassifiedError, ErrorCategory, classify_error};
use crate::error::StorageError;
use crate::store::{KvStore, get_json, set_json};

/// Durable key holding the error buffer.
pub const ERROR_BUFFER_KEY: &str = "errorBuffer";

/// Default number of records kept.
pub const DEFAULT_BUFFER_CAP: usize = 100;

const MAX_MESSAGE_CHARS: usize = 500;
const MAX_DETAIL_CHARS: usize = 300;

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
    pub context_tag: String,
    /// Error source chain, when it adds anything to `message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub version: String,
}

fn trim(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Ring buffer of recent errors backed by the durable store.
pub struct ErrorBuffer {
    store: Arc<dyn KvStore>,
    cap: usize,
    /// Serializes read-modify-write cycles within this worker.
    write_lock: Mutex<()>,
}

impl ErrorBuffer {
    pub fn new(store: Arc<dyn KvStore>, cap: usize) -> Self {
        Self {
            store,
            cap: cap.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Classify and record an error. Never fails.
    pub async fn record<E: fmt::Display + ?Sized>(&self, error: &E, context: &str) {
        let message = error.to_string();
        let chained = format!("{error:#}");
        let record = ErrorRecord {
            category: classify_error(error),
            detail: (chained != message).then(|| trim(&chained, MAX_DETAIL_CHARS)),
            message: trim(&message, MAX_MESSAGE_CHARS),
            timestamp: Utc::now(),
            context_tag: context.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        self.push(record).await;
    }

    /// Record an already-classified error, keeping its category.
    pub async fn record_classified(&self, error: &ClassifiedError, context: &str) {
        let record = ErrorRecord {
            message: trim(&error.message, MAX_MESSAGE_CHARS),
            category: error.category,
            timestamp: error.timestamp,
            context_tag: context.to_string(),
            detail: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        self.push(record).await;
    }

    async fn push(&self, record: ErrorRecord) {
        debug!(
            category = %record.category,
            context = %record.context_tag,
            message = %record.message,
            "Recording error"
        );
        if let Err(e) = self.try_push(record).await {
            // Recording an error must not produce another one.
            warn!(error = %e, "Failed to persist error record");
        }
    }

    async fn try_push(&self, record: ErrorRecord) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut buffer: Vec<ErrorRecord> = get_json(self.store.as_ref(), ERROR_BUFFER_KEY)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Error buffer unreadable, starting fresh");
                None
            })
            .unwrap_or_default();
        buffer.push(record);
        if buffer.len() > self.cap {
            let excess = buffer.len() - self.cap;
            buffer.drain(..excess);
        }
        set_json(self.store.as_ref(), ERROR_BUFFER_KEY, &buffer).await
    }

    /// All buffered records, oldest first.
    pub async fn get_error_buffer(&self) -> Result<Vec<ErrorRecord>, StorageError> {
        Ok(get_json(self.store.as_ref(), ERROR_BUFFER_KEY)
            .await?
            .unwrap_or_default())
    }

    /// Empty the buffer.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        set_json(self.store.as_ref(), ERROR_BUFFER_KEY, &Vec::<ErrorRecord>::new()).await
    }

    /// Run a fallible future; on failure, record it and return a classified error.
    pub async fn boundary<T, E, F>(&self, context: &str, fut: F) -> Result<T, ClassifiedError>
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        match fut.await {
            Ok(value) => Ok(value),
            Err(e) => {
                let classified = ClassifiedError::from_display(&e);
                self.record(&e, context).await;
                Err(classified)
            }
        }
    }

    /// Like [`boundary`](Self::boundary) but substitutes `fallback` on failure.
    pub async fn boundary_or<T, E, F>(&self, context: &str, fut: F, fallback: T) -> T
    where
        F: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.boundary(context, fut).await.unwrap_or(fallback)
    }
}
