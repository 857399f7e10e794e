//! Circuit breaker.
//!
//! `Closed` counts failures; reaching the threshold opens the breaker.
//! `Open` rejects calls until the reset timeout has elapsed since the last
//! failure, then admits a single trial call in `HalfOpen`. The trial's
//! success closes the breaker; its failure re-opens it.
//!
//! State is per process and is not persisted.

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        write!(f, "{s}")
    }
}

/// Failure of a guarded call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the operation.
    #[error("Circuit breaker is open")]
    Open,

    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open => None,
            Self::Inner(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerOptions {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Guards one call site against a repeatedly failing operation.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    options: BreakerOptions,
    inner: Mutex<Inner>,
}

/// Releases the half-open trial slot if the trial future is dropped early.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, options: BreakerOptions) -> Self {
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Decide whether a call may go ahead. Returns whether it is the trial.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Some(false),
            BreakerState::Open => {
                let cooled = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.options.reset_timeout);
                if !cooled {
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                info!(breaker = %self.name, "Circuit breaker half-open, admitting trial call");
                Some(true)
            }
            BreakerState::HalfOpen if inner.trial_in_flight => None,
            BreakerState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(true)
            }
        }
    }

    /// Run `op` through the breaker.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(is_trial) = self.admit() else {
            return Err(BreakerError::Open);
        };
        let mut slot = TrialSlot {
            breaker: self,
            armed: is_trial,
        };

        let result = op().await;
        slot.armed = false;

        let mut inner = self.lock();
        inner.trial_in_flight = false;
        match result {
            Ok(value) => {
                if inner.state != BreakerState::Closed {
                    info!(breaker = %self.name, "Circuit breaker closed");
                }
                inner.state = BreakerState::Closed;
                inner.failures = 0;
                Ok(value)
            }
            Err(e) => {
                inner.failures = inner.failures.saturating_add(1);
                inner.last_failure = Some(Instant::now());
                let reopen = inner.state == BreakerState::HalfOpen
                    || inner.failures >= self.options.failure_threshold;
                if reopen && inner.state != BreakerState::Open {
                    warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "Circuit breaker opened"
                    );
                    inner.state = BreakerState::Open;
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Force the breaker closed and forget past failures.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.last_failure = None;
        inner.trial_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::oneshot;

    const RESET: Duration = Duration::from_secs(30);

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "license-api",
            BreakerOptions {
                failure_threshold: 3,
                reset_timeout: RESET,
            },
        ))
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.execute(|| async { Err::<(), _>("fetch failed") }).await
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let b = breaker();
        for expected in 1..=2 {
            assert_eq!(fail(&b).await, Err(BreakerError::Inner("fetch failed")));
            assert_eq!(b.failure_count(), expected);
            assert_eq!(b.state(), BreakerState::Closed);
        }
        assert_eq!(fail(&b).await, Err(BreakerError::Inner("fetch failed")));
        assert_eq!(b.state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let result = b
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, &str>(()) }
            })
            .await;
        assert_eq!(result, Err(BreakerError::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial_then_closes() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(RESET + Duration::from_millis(1)).await;

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trial = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, &str>("trial ok")
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // A concurrent caller during the trial is rejected.
        let concurrent = b.execute(|| async { Ok::<_, &str>("sneaky") }).await;
        assert_eq!(concurrent, Err(BreakerError::Open));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap(), Ok("trial ok"));
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_and_restamps() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(RESET + Duration::from_millis(1)).await;
        assert!(fail(&b).await.unwrap_err().into_inner().is_some());
        assert_eq!(b.state(), BreakerState::Open);

        // The reset timeout restarts from the trial's failure.
        tokio::time::advance(RESET / 2).await;
        assert!(fail(&b).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_count() {
        let b = breaker();
        let _ = fail(&b).await;
        let _ = fail(&b).await;
        b.execute(|| async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(b.failure_count(), 0);
        let _ = fail(&b).await;
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let b = breaker();
        for _ in 0..3 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(RESET + Duration::from_millis(1)).await;

        let stuck = {
            let b = b.clone();
            tokio::spawn(async move {
                b.execute(|| std::future::pending::<Result<(), &str>>()).await
            })
        };
        tokio::task::yield_now().await;
        stuck.abort();
        let _ = stuck.await;

        let next = b.execute(|| async { Ok::<_, &str>(1) }).await;
        assert_eq!(next, Ok(1));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn state_display() {
        assert_eq!(BreakerState::HalfOpen.to_string(), "half-open");
        let err: BreakerError<String> = BreakerError::Open;
        assert_eq!(err.to_string(), "Circuit breaker is open");
    }
}
