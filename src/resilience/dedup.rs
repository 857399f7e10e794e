//! In-flight request de-duplication.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::debug;

/// Identity of an outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub method: String,
    pub target: String,
}

impl RequestKey {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.method, self.target)
    }
}

struct InFlight<T> {
    id: u64,
    shared: Shared<BoxFuture<'static, T>>,
}

/// Collapses concurrent identical calls into one.
///
/// While a call for a key is outstanding, later callers with the same key
/// await the same result instead of issuing their own call. `T` is usually
/// a `Result` with a cloneable error.
pub struct Deduplicator<T: Clone> {
    in_flight: Mutex<HashMap<RequestKey, InFlight<T>>>,
    next_id: AtomicU64,
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `make()` for `key`, or join the call already in flight.
    pub async fn run<F, Fut>(&self, key: RequestKey, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (id, shared) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!(key = %key, "Joining in-flight request");
                    (existing.id, existing.shared.clone())
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let shared = make().boxed().shared();
                    in_flight.insert(
                        key.clone(),
                        InFlight {
                            id,
                            shared: shared.clone(),
                        },
                    );
                    (id, shared)
                }
            }
        };

        let output = shared.await;

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.get(&key).is_some_and(|entry| entry.id == id) {
            in_flight.remove(&key);
        }
        output
    }

    /// Number of distinct calls currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl<T> Default for Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_calls_share_one_result() {
        let dedup: Deduplicator<Result<u32, String>> = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let call = |n: u32| {
            let calls = calls.clone();
            dedup.run(RequestKey::get("https://api.example/license"), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(n)
            })
        };
        let (a, b) = tokio::join!(call(1), call(2));

        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_and_later_calls_run_separately() {
        let dedup: Deduplicator<u32> = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let run = |key: RequestKey, n: u32| {
            let calls = calls.clone();
            dedup.run(key, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                n
            })
        };

        let (a, b) = tokio::join!(
            run(RequestKey::get("/patterns"), 1),
            run(RequestKey::new("POST", "/patterns"), 2)
        );
        assert_eq!((a, b), (1, 2));

        assert_eq!(run(RequestKey::get("/patterns"), 3).await, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn key_display() {
        assert_eq!(RequestKey::get("/x").to_string(), "GET:/x");
    }
}
