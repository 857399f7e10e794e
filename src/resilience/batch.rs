//! Call batching.
//!
//! Items accumulate until the batch is full or the oldest item has waited
//! `max_wait`, then one combined call runs and results are handed back by
//! position.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ResilienceError;

type BatchFn<I, O> = Arc<dyn Fn(Vec<I>) -> BoxFuture<'static, anyhow::Result<Vec<O>>> + Send + Sync>;
type Waiter<O> = oneshot::Sender<Result<O, ResilienceError>>;

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub max_batch_size: usize,
    pub max_wait: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait: Duration::from_millis(100),
        }
    }
}

struct Pending<I, O> {
    items: Vec<(I, Waiter<O>)>,
    timer: Option<JoinHandle<()>>,
}

/// Batches individual calls into combined calls.
pub struct Batcher<I, O> {
    batch_fn: BatchFn<I, O>,
    options: BatchOptions,
    pending: Mutex<Pending<I, O>>,
}

impl<I, O> Batcher<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(batch_fn: F, options: BatchOptions) -> Arc<Self>
    where
        F: Fn(Vec<I>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<O>>> + Send + 'static,
    {
        Arc::new(Self {
            batch_fn: Arc::new(move |items| batch_fn(items).boxed()),
            options: BatchOptions {
                max_batch_size: options.max_batch_size.max(1),
                ..options
            },
            pending: Mutex::new(Pending {
                items: Vec::new(),
                timer: None,
            }),
        })
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Pending<I, O>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `item` and wait for its result from the combined call.
    pub async fn add(self: &Arc<Self>, item: I) -> Result<O, ResilienceError> {
        let (tx, rx) = oneshot::channel();
        let full = {
            let mut pending = self.pending();
            pending.items.push((item, tx));
            if pending.items.len() >= self.options.max_batch_size {
                if let Some(timer) = pending.timer.take() {
                    timer.abort();
                }
                Some(std::mem::take(&mut pending.items))
            } else {
                if pending.timer.is_none() {
                    let this = Arc::clone(self);
                    let wait = self.options.max_wait;
                    pending.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        this.pending().timer = None;
                        this.flush().await;
                    }));
                }
                None
            }
        };

        if let Some(batch) = full {
            // Run detached so one caller going away cannot cancel the batch.
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run(batch).await });
        }
        rx.await.map_err(|_| ResilienceError::BatchDropped)?
    }

    /// Send whatever is queued now.
    pub async fn flush(&self) {
        let batch = {
            let mut pending = self.pending();
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
            std::mem::take(&mut pending.items)
        };
        if !batch.is_empty() {
            self.run(batch).await;
        }
    }

    async fn run(&self, batch: Vec<(I, Waiter<O>)>) {
        let size = batch.len();
        let (items, waiters): (Vec<I>, Vec<Waiter<O>>) = batch.into_iter().unzip();
        debug!(size, "Running batch");

        match (self.batch_fn)(items).await {
            Ok(results) => {
                if results.len() < size {
                    warn!(expected = size, got = results.len(), "Batch returned too few results");
                }
                let mut results = results.into_iter();
                for (index, waiter) in waiters.into_iter().enumerate() {
                    let outcome = results
                        .next()
                        .ok_or(ResilienceError::BatchResultMissing { index });
                    let _ = waiter.send(outcome);
                }
            }
            Err(e) => {
                warn!(size, error = %e, "Batch call failed");
                let message = e.to_string();
                for waiter in waiters {
                    let _ = waiter.send(Err(ResilienceError::BatchFailed(message.clone())));
                }
            }
        }
    }

    /// Items waiting for the next batch.
    pub fn queued(&self) -> usize {
        self.pending().items.len()
    }
}
