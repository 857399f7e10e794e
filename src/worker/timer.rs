//! Wake timers: the host facility that calls the worker back later.
//!
//! Alarms are named. Arming a name that is already armed replaces the
//! pending arm, so one name never has more than one pending wake-up.
//! Fired names are delivered on a channel that acts as the single alarm
//! listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SchedulerError;
use crate::worker::clock::Clock;

/// A one-shot, replaceable, named wake-up facility.
#[async_trait]
pub trait WakeTimer: Send + Sync {
    /// Fire `name` at or after `at`, replacing any pending arm of `name`.
    async fn arm(&self, name: &str, at: DateTime<Utc>) -> Result<(), SchedulerError>;

    /// Cancel a pending arm. Cancelling an unarmed name is a no-op.
    async fn cancel(&self, name: &str) -> Result<(), SchedulerError>;

    /// When `name` is due to fire, if armed.
    async fn armed(&self, name: &str) -> Option<DateTime<Utc>>;
}

struct TokioArm {
    at: DateTime<Utc>,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Wake timer built on tokio sleeps, one spawned task per armed name.
pub struct TokioWakeTimer {
    clock: Arc<dyn Clock>,
    arms: Arc<Mutex<HashMap<String, TokioArm>>>,
    generation: AtomicU64,
    fired_tx: mpsc::UnboundedSender<String>,
}

impl TokioWakeTimer {
    /// Create a timer and the receiver on which fired alarm names arrive.
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let timer = Self {
            clock,
            arms: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            fired_tx,
        };
        (timer, fired_rx)
    }
}

#[async_trait]
impl WakeTimer for TokioWakeTimer {
    async fn arm(&self, name: &str, at: DateTime<Utc>) -> Result<(), SchedulerError> {
        let delay = (at - self.clock.now()).to_std().unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let arms_for_task = Arc::clone(&self.arms);
        let fired_tx = self.fired_tx.clone();
        let alarm = name.to_string();

        // Hold the map lock while spawning so the task cannot look for its
        // entry before it is inserted.
        let mut arms = self.arms.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut arms = arms_for_task.lock().unwrap_or_else(|e| e.into_inner());
                match arms.get(&alarm) {
                    Some(arm) if arm.generation == generation => {
                        arms.remove(&alarm);
                    }
                    // Replaced or cancelled while we slept.
                    _ => return,
                }
            }
            debug!(alarm = %alarm, "Wake alarm fired");
            let _ = fired_tx.send(alarm);
        });
        if let Some(previous) = arms.insert(name.to_string(), TokioArm { at, generation, handle }) {
            previous.handle.abort();
        }
        drop(arms);
        debug!(alarm = %name, at = %at, delay_ms = delay.as_millis() as u64, "Wake alarm armed");
        Ok(())
    }

    async fn cancel(&self, name: &str) -> Result<(), SchedulerError> {
        let removed = self
            .arms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        if let Some(arm) = removed {
            arm.handle.abort();
            debug!(alarm = %name, "Wake alarm cancelled");
        }
        Ok(())
    }

    async fn armed(&self, name: &str) -> Option<DateTime<Utc>> {
        self.arms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|arm| arm.at)
    }
}

impl Drop for TokioWakeTimer {
    fn drop(&mut self) {
        let arms = self.arms.lock().unwrap_or_else(|e| e.into_inner());
        for arm in arms.values() {
            arm.handle.abort();
        }
    }
}

/// Wake timer that never fires on its own; the host fires it explicitly.
///
/// Fits hosts whose alarm facility lives outside the process, and makes
/// scheduling deterministic in tests.
#[derive(Default)]
pub struct ManualWakeTimer {
    arms: Mutex<HashMap<String, DateTime<Utc>>>,
    arm_calls: AtomicUsize,
}

impl ManualWakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the pending arm of `name`. Returns whether it was armed.
    pub fn fire(&self, name: &str) -> bool {
        self.arms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Number of names currently armed.
    pub fn armed_count(&self) -> usize {
        self.arms.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total `arm` calls made so far.
    pub fn arm_calls(&self) -> usize {
        self.arm_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WakeTimer for ManualWakeTimer {
    async fn arm(&self, name: &str, at: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.arm_calls.fetch_add(1, Ordering::SeqCst);
        self.arms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), at);
        Ok(())
    }

    async fn cancel(&self, name: &str) -> Result<(), SchedulerError> {
        self.arms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        Ok(())
    }

    async fn armed(&self, name: &str) -> Option<DateTime<Utc>> {
        self.arms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }
}
