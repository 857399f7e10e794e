//! Retry with exponential backoff and jitter.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Upper bound of the random jitter, as a fraction of the computed delay.
const JITTER_RATIO: f64 = 0.1;

type RetryPredicate<E> = Arc<dyn Fn(&E, u32) -> bool + Send + Sync>;

/// Backoff policy for [`retry`].
pub struct RetryOptions<E> {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    retry_on: Option<RetryPredicate<E>>,
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            retry_on: None,
        }
    }
}

impl<E> Clone for RetryOptions<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            retry_on: self.retry_on.clone(),
        }
    }
}

impl<E> RetryOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Only retry when `predicate(error, attempt)` holds.
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled.max(0.0))
        }
    }

    fn should_retry(&self, error: &E, attempt: u32) -> bool {
        self.retry_on
            .as_ref()
            .is_none_or(|predicate| predicate(error, attempt))
    }
}

/// Run `op` until it succeeds or the policy gives up.
///
/// `op` receives the 1-based attempt number. The last error is returned
/// unchanged once attempts run out or `retry_on` declines.
pub async fn retry<T, E, F, Fut>(mut op: F, options: &RetryOptions<E>) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= options.max_attempts || !options.should_retry(&e, attempt) {
                    return Err(e);
                }
                let delay = options.delay_for(attempt);
                let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..JITTER_RATIO));
                warn!(
                    attempt,
                    max_attempts = options.max_attempts,
                    delay_ms = (delay + jitter).as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay + jitter).await;
                attempt += 1;
            }
        }
    }
}
