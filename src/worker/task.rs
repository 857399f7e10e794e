//! Deferred task records and handlers.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of deferred work, persisted verbatim in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Handler key.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque handler input.
    #[serde(default)]
    pub data: Value,
    /// Earliest time the task may run.
    pub scheduled_for: DateTime<Utc>,
    /// When the task was enqueued.
    pub added_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        kind: impl Into<String>,
        data: Value,
        scheduled_for: DateTime<Utc>,
        added_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: kind.into(),
            data,
            scheduled_for,
            added_at,
        }
    }

    /// Sort key. Equal keys keep insertion order.
    pub fn order_key(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.scheduled_for, self.added_at)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for <= now
    }
}

/// Insert `task` into an ordered queue after every task with an equal or
/// earlier key.
pub fn insert_ordered(queue: &mut Vec<Task>, task: Task) {
    let key = task.order_key();
    let at = queue.partition_point(|t| t.order_key() <= key);
    queue.insert(at, task);
}

/// Runs tasks of one type.
///
/// Failures are logged and the task is dropped; handlers that want retries
/// use the resilience combinators themselves.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, data: Value) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, data: Value) -> anyhow::Result<()> {
        (self)(data).await
    }
}
