//! Persistent state: an in-memory tree mirrored to one durable key.
//!
//! Reads and writes hit the in-memory tree. Every `set` restarts a debounce
//! timer; when it expires the whole tree is written in one store call.
//! A crash inside the debounce window loses that window's writes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::diagnostics::{ErrorBuffer, ErrorSink, spawn_recorded};
use crate::error::StateError;
use crate::store::KvStore;
use crate::worker::Clock;

/// Default durable key for the state tree.
pub const DEFAULT_STATE_KEY: &str = "appState";

/// Default debounce delay between the last `set` and the flush.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_secs(1);

/// Tree used when nothing has been persisted yet.
pub fn default_tree() -> Value {
    json!({ "settings": {}, "cache": {}, "lastUpdated": null })
}

struct Tree {
    loaded: bool,
    root: Value,
}

/// Debounced, write-through mirror of one durable key.
pub struct PersistentState {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    key: String,
    flush_delay: Duration,
    tree: Mutex<Tree>,
    save_timer: StdMutex<Option<JoinHandle<()>>>,
    flushes: AtomicUsize,
    errors: ErrorSink,
}

impl PersistentState {
    pub fn new(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        flush_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            key: key.into(),
            flush_delay,
            tree: Mutex::new(Tree {
                loaded: false,
                root: Value::Null,
            }),
            save_timer: StdMutex::new(None),
            flushes: AtomicUsize::new(0),
            errors: ErrorSink::default(),
        })
    }

    /// Record panics in the background flush into `errors`.
    pub fn set_error_buffer(&self, errors: Arc<ErrorBuffer>) -> bool {
        self.errors.attach(errors)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the durable copy, or the default tree when there is none.
    ///
    /// Re-running `init` discards unflushed in-memory changes.
    pub async fn init(&self) -> Result<Value, StateError> {
        let mut tree = self.tree.lock().await;
        self.load_into(&mut tree).await?;
        Ok(tree.root.clone())
    }

    async fn load_into(&self, tree: &mut Tree) -> Result<(), StateError> {
        tree.root = match self.store.get(&self.key).await? {
            Some(value @ Value::Object(_)) => value,
            Some(other) => {
                warn!(key = %self.key, found = %kind_of(&other), "Persisted state is not an object, using defaults");
                default_tree()
            }
            None => default_tree(),
        };
        tree.loaded = true;
        info!(key = %self.key, "Persistent state loaded");
        Ok(())
    }

    async fn loaded(&self) -> Result<MutexGuard<'_, Tree>, StateError> {
        let mut tree = self.tree.lock().await;
        if !tree.loaded {
            self.load_into(&mut tree).await?;
        }
        Ok(tree)
    }

    /// Value at a dot-separated path. Loads the durable copy on first use.
    pub async fn get(&self, path: &str) -> Result<Option<Value>, StateError> {
        let segments = parse_path(path)?;
        let tree = self.loaded().await?;
        Ok(lookup(&tree.root, &segments).cloned())
    }

    /// Value at `path`, decoded into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, StateError> {
        match self.get(path).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StateError::Decode {
                    path: path.to_string(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Copy of the whole tree.
    pub async fn snapshot(&self) -> Result<Value, StateError> {
        Ok(self.loaded().await?.root.clone())
    }

    /// Write `value` at `path` and schedule a debounced flush.
    ///
    /// Missing or non-object intermediate nodes become empty objects.
    pub async fn set(self: &Arc<Self>, path: &str, value: Value) -> Result<(), StateError> {
        let segments = parse_path(path)?;
        {
            let mut tree = self.loaded().await?;
            let root = ensure_object(&mut tree.root);
            root.insert("lastUpdated".into(), json!(self.clock.now().timestamp_millis()));

            let (last, parents) = segments
                .split_last()
                .ok_or_else(|| StateError::InvalidPath { path: path.to_string() })?;
            let mut node = &mut tree.root;
            for segment in parents {
                node = ensure_object(node)
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            ensure_object(node).insert(last.to_string(), value);
        }
        debug!(key = %self.key, path, "State updated");
        self.schedule_save();
        Ok(())
    }

    /// Restart the debounce timer.
    fn schedule_save(self: &Arc<Self>) {
        let mut slot = self.save_timer.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let this = Arc::clone(self);
        let delay = self.flush_delay;
        let errors = self.errors.get();
        *slot = Some(spawn_recorded(errors, "state-flush", async move {
            tokio::time::sleep(delay).await;
            this.save_timer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Err(e) = this.write_tree().await {
                warn!(key = %this.key, error = %e, "State flush failed, retrying next cycle");
                this.schedule_save();
            }
        }));
    }

    /// Flush the whole tree now, cancelling any pending debounced flush.
    pub async fn save(&self) -> Result<(), StateError> {
        if let Some(pending) = self
            .save_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            pending.abort();
        }
        self.write_tree().await
    }

    async fn write_tree(&self) -> Result<(), StateError> {
        let tree = self.tree.lock().await;
        if !tree.loaded {
            return Ok(());
        }
        self.store.set(&self.key, &tree.root).await?;
        let n = self.flushes.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(key = %self.key, flushes = n, "State flushed");
        Ok(())
    }

    /// Whether a debounced flush is waiting.
    pub fn has_pending_flush(&self) -> bool {
        self.save_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Successful flushes since construction.
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl Drop for PersistentState {
    fn drop(&mut self) {
        if let Some(pending) = self
            .save_timer
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            pending.abort();
        }
    }
}

fn parse_path(path: &str) -> Result<Vec<&str>, StateError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(StateError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(segments)
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments.iter().try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(*segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
