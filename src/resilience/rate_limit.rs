//! Fixed-window rate limiter with FIFO admission.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Window {
    started: Instant,
    admitted: usize,
}

/// Admits at most `max_per_window` calls per window.
///
/// Callers over the bound wait for the next window. Waiters queue on a
/// fair mutex, so they are released in submission order.
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window: max_per_window.max(1),
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                admitted: 0,
            }),
        }
    }

    pub fn per_second(max: usize) -> Self {
        Self::new(max, Duration::from_secs(1))
    }

    /// Wait for a slot.
    pub async fn acquire(&self) {
        let mut window = self.state.lock().await;
        loop {
            let now = Instant::now();
            if now >= window.started + self.window {
                window.started = now;
                window.admitted = 0;
            }
            if window.admitted < self.max_per_window {
                window.admitted += 1;
                return;
            }
            let reopens = window.started + self.window;
            debug!(
                wait_ms = reopens.saturating_duration_since(now).as_millis() as u64,
                "Rate limit reached, waiting for next window"
            );
            tokio::time::sleep_until(reopens).await;
        }
    }

    /// Run `fut` once a slot is free.
    pub async fn throttle<F: Future>(&self, fut: F) -> F::Output {
        self.acquire().await;
        fut.await
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::per_second(10)
    }
}
