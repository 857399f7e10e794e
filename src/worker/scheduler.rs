//! Durable task scheduler.
//!
//! One persisted, ordered task list and one wake alarm:
//! - `add_task()`: insert, persist, re-target the alarm at the earliest task
//! - `on_alarm()`: run every due task in order, persist, re-arm
//! - `init()`: rehydrate from the durable store on worker start
//!
//! The in-memory list is only a mirror; every mutation reaches the store
//! before the scheduler acts on it.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::diagnostics::ErrorBuffer;
use crate::error::{SchedulerError, StorageError};
use crate::store::{KvStore, get_json, set_json};
use crate::worker::clock::Clock;
use crate::worker::state::SchedulerPhase;
use crate::worker::task::{Task, TaskHandler, insert_ordered};
use crate::worker::timer::WakeTimer;

/// Durable key holding the pending task list.
pub const PENDING_TASKS_KEY: &str = "pendingTasks";

/// Outcome of one alarm.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FireReport {
    /// Tasks whose handler returned `Ok`.
    pub succeeded: usize,
    /// Tasks whose handler failed or panicked. These are dropped.
    pub failed: usize,
    /// Tasks with no registered handler. These are dropped.
    pub unhandled: usize,
}

impl FireReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.unhandled
    }
}

/// Schedules deferred work across worker restarts.
pub struct Scheduler {
    store: Arc<dyn KvStore>,
    timer: Arc<dyn WakeTimer>,
    clock: Arc<dyn Clock>,
    errors: Option<Arc<ErrorBuffer>>,
    alarm_name: String,
    granularity: Duration,
    /// Mirror of the persisted queue, ordered by `Task::order_key`.
    tasks: Mutex<Vec<Task>>,
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    phase: std::sync::Mutex<SchedulerPhase>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn KvStore>,
        timer: Arc<dyn WakeTimer>,
        clock: Arc<dyn Clock>,
        alarm_name: impl Into<String>,
        granularity: Duration,
    ) -> Self {
        Self {
            store,
            timer,
            clock,
            errors: None,
            alarm_name: alarm_name.into(),
            granularity,
            tasks: Mutex::new(Vec::new()),
            handlers: RwLock::new(HashMap::new()),
            phase: std::sync::Mutex::new(SchedulerPhase::Idle),
        }
    }

    /// Record failing tasks into `errors`.
    pub fn with_error_buffer(mut self, errors: Arc<ErrorBuffer>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn alarm_name(&self) -> &str {
        &self.alarm_name
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition_to(&self, target: SchedulerPhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        if !phase.can_transition_to(target) {
            warn!(from = %*phase, to = %target, "Unexpected scheduler phase transition");
        }
        *phase = target;
    }

    /// Register the handler for a task type. Returns the handler it replaced.
    pub fn register_handler(
        &self,
        kind: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Option<Arc<dyn TaskHandler>> {
        let kind = kind.into();
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.clone(), handler);
        if previous.is_some() {
            warn!(task_type = %kind, "Task handler re-registered, previous handler replaced");
        } else {
            debug!(task_type = %kind, "Registered task handler");
        }
        previous
    }

    /// Remove the handler for a task type.
    pub fn unregister_handler(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(kind)
    }

    fn handler(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
    }

    /// Rehydrate the queue from the durable store and re-arm the alarm.
    ///
    /// Safe to call repeatedly: the durable copy replaces the mirror rather
    /// than being appended to it, and arming replaces any pending arm.
    pub async fn init(&self) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock().await;
        let mut persisted: Vec<Task> = get_json(self.store.as_ref(), PENDING_TASKS_KEY)
            .await
            .map_err(|e| match e {
                StorageError::Serialization(msg) => SchedulerError::CorruptQueue(msg),
                other => SchedulerError::Storage(other),
            })?
            .unwrap_or_default();
        // Stable sort keeps persisted order for equal keys.
        persisted.sort_by_key(Task::order_key);
        *tasks = persisted;

        info!(pending = tasks.len(), "Task scheduler initialized");
        self.arm_next(&tasks).await
    }

    /// Enqueue a task to run no earlier than `delay` from now.
    pub async fn add_task(
        &self,
        kind: impl Into<String>,
        data: Value,
        delay: Duration,
    ) -> Result<Task, SchedulerError> {
        let now = self.clock.now();
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let scheduled_for = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let task = Task::new(kind, data, scheduled_for, now);

        let mut tasks = self.tasks.lock().await;
        let mut next = tasks.clone();
        insert_ordered(&mut next, task.clone());
        self.persist(&next).await?;
        *tasks = next;

        debug!(
            task_type = %task.kind,
            scheduled_for = %task.scheduled_for,
            pending = tasks.len(),
            "Task queued"
        );
        self.arm_next(&tasks).await?;
        Ok(task)
    }

    /// Handle a fired alarm. Alarms for other names are ignored.
    pub async fn on_alarm(&self, name: &str) -> Result<FireReport, SchedulerError> {
        if name != self.alarm_name {
            return Ok(FireReport::default());
        }
        self.process_due().await
    }

    /// Run every task due now, in ascending due order.
    pub async fn process_due(&self) -> Result<FireReport, SchedulerError> {
        let due = {
            let mut tasks = self.tasks.lock().await;
            if self.phase().is_firing() {
                debug!("Alarm while already firing, skipping");
                return Ok(FireReport::default());
            }

            let now = self.clock.now();
            let split = tasks.partition_point(|t| t.is_due(now));

            // Persist the removal first: a crash mid-run loses the batch
            // rather than running it twice.
            if let Err(e) = self.persist(&tasks[split..]).await {
                self.arm_next(&tasks).await?;
                return Err(e);
            }
            self.transition_to(SchedulerPhase::Firing);
            tasks.drain(..split).collect::<Vec<Task>>()
        };

        let mut report = FireReport::default();
        for task in due {
            self.run_task(task, &mut report).await;
        }

        let tasks = self.tasks.lock().await;
        if report.total() > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                unhandled = report.unhandled,
                pending = tasks.len(),
                "Processed due tasks"
            );
        }
        let retargeted = self.retarget(&tasks).await;
        self.transition_to(*retargeted.as_ref().unwrap_or(&SchedulerPhase::Idle));
        retargeted.map(|_| report)
    }

    async fn run_task(&self, task: Task, report: &mut FireReport) {
        let Some(handler) = self.handler(&task.kind) else {
            warn!(task_type = %task.kind, "No handler registered, dropping task");
            report.unhandled += 1;
            return;
        };

        let outcome = AssertUnwindSafe(handler.run(task.data))
            .catch_unwind()
            .await;
        let context = format!("task:{}", task.kind);
        match outcome {
            Ok(Ok(())) => {
                debug!(task_type = %task.kind, "Task completed");
                report.succeeded += 1;
            }
            Ok(Err(e)) => {
                error!(task_type = %task.kind, error = %e, "Task failed, dropping");
                if let Some(errors) = &self.errors {
                    errors.record(&e, &context).await;
                }
                report.failed += 1;
            }
            Err(_) => {
                error!(task_type = %task.kind, "Task handler panicked, dropping");
                if let Some(errors) = &self.errors {
                    errors.record("task handler panicked", &context).await;
                }
                report.failed += 1;
            }
        }
    }

    /// Point the single alarm at the earliest task and settle the phase.
    ///
    /// While a batch is running the phase stays `Firing`; the batch settles
    /// it when done.
    async fn arm_next(&self, tasks: &[Task]) -> Result<(), SchedulerError> {
        let target = self.retarget(tasks).await?;
        if !self.phase().is_firing() {
            self.transition_to(target);
        }
        Ok(())
    }

    /// Arm the alarm for the earliest task, or cancel it when empty.
    async fn retarget(&self, tasks: &[Task]) -> Result<SchedulerPhase, SchedulerError> {
        let Some(next) = tasks.first() else {
            self.timer.cancel(&self.alarm_name).await?;
            return Ok(SchedulerPhase::Idle);
        };

        // The host timer cannot fire sooner than its granularity.
        let granularity =
            chrono::Duration::from_std(self.granularity).unwrap_or(chrono::Duration::MAX);
        let floor = self
            .clock
            .now()
            .checked_add_signed(granularity)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let at = next.scheduled_for.max(floor);
        self.timer.arm(&self.alarm_name, at).await?;
        debug!(alarm = %self.alarm_name, at = %at, "Scheduler armed");
        Ok(SchedulerPhase::Armed)
    }

    async fn persist(&self, tasks: &[Task]) -> Result<(), SchedulerError> {
        set_json(self.store.as_ref(), PENDING_TASKS_KEY, tasks).await?;
        Ok(())
    }

    /// Snapshot of pending tasks in run order.
    pub async fn pending(&self) -> Vec<Task> {
        self.tasks.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    /// Drop every pending task and cancel the alarm.
    pub async fn clear(&self) -> Result<(), SchedulerError> {
        let mut tasks = self.tasks.lock().await;
        self.persist(&[]).await?;
        tasks.clear();
        self.arm_next(&tasks).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::ErrorCategory;
    use crate::store::MemoryStore;
    use crate::store::test_support::FlakyStore;
    use crate::worker::clock::ManualClock;
    use crate::worker::timer::ManualWakeTimer;
    use serde_json::json;

    const ALARM: &str = "task-processor";
    const MINUTE: Duration = Duration::from_secs(60);

    struct Harness {
        store: Arc<MemoryStore>,
        timer: Arc<ManualWakeTimer>,
        clock: Arc<ManualClock>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                timer: Arc::new(ManualWakeTimer::new()),
                clock: Arc::new(ManualClock::new(
                    DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                )),
            }
        }

        fn scheduler(&self) -> Scheduler {
            Scheduler::new(
                self.store.clone(),
                self.timer.clone(),
                self.clock.clone(),
                ALARM,
                MINUTE,
            )
        }
    }

    fn recorder() -> (Arc<std::sync::Mutex<Vec<Value>>>, Arc<dyn TaskHandler>) {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn TaskHandler> = Arc::new(move |data: Value| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(data);
                anyhow::Ok(())
            }
        });
        (seen, handler)
    }

    #[tokio::test]
    async fn due_tasks_run_in_due_order() {
        let h = Harness::new();
        let scheduler = h.scheduler();
        let (seen, handler) = recorder();
        scheduler.register_handler("job", handler);

        scheduler.add_task("job", json!(10), Duration::from_secs(10)).await.unwrap();
        scheduler.add_task("job", json!(20), Duration::from_secs(20)).await.unwrap();
        scheduler.add_task("job", json!(5), Duration::from_secs(5)).await.unwrap();

        h.clock.advance(Duration::from_secs(25));
        let report = scheduler.on_alarm(ALARM).await.unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(*seen.lock().unwrap(), vec![json!(5), json!(10), json!(20)]);
        assert!(scheduler.is_empty().await);
        assert_eq!(scheduler.phase(), SchedulerPhase::Idle);
        assert_eq!(h.timer.armed_count(), 0);
    }

    #[tokio::test]
    async fn single_alarm_targets_earliest_task() {
        let h = Harness::new();
        let scheduler = h.scheduler();
        let start = h.clock.now();

        scheduler.add_task("a", json!(null), 10 * MINUTE).await.unwrap();
        assert_eq!(h.timer.armed(ALARM).await, Some(start + chrono::Duration::minutes(10)));

        scheduler.add_task("b", json!(null), 3 * MINUTE).await.unwrap();
        assert_eq!(h.timer.armed(ALARM).await, Some(start + chrono::Duration::minutes(3)));

        scheduler.add_task("c", json!(null), 30 * MINUTE).await.unwrap();
        assert_eq!(h.timer.armed(ALARM).await, Some(start + chrono::Duration::minutes(3)));

        assert_eq!(h.timer.armed_count(), 1);
        assert_eq!(scheduler.phase(), SchedulerPhase::Armed);
    }

    #[tokio::test]
    async fn short_delays_clamp_alarm_not_due_time() {
        let h = Harness::new();
        let scheduler = h.scheduler();
        let start = h.clock.now();

        let task = scheduler.add_task("quick", json!(null), Duration::from_secs(1)).await.unwrap();
        assert_eq!(task.scheduled_for, start + chrono::Duration::seconds(1));
        assert_eq!(h.timer.armed(ALARM).await, Some(start + chrono::Duration::minutes(1)));
    }

    #[tokio::test]
    async fn future_tasks_stay_queued_and_rearm() {
        let h = Harness::new();
        let scheduler = h.scheduler();
        let (seen, handler) = recorder();
        scheduler.register_handler("job", handler);

        scheduler.add_task("job", json!("soon"), 2 * MINUTE).await.unwrap();
        scheduler.add_task("job", json!("later"), 10 * MINUTE).await.unwrap();

        h.clock.advance(3 * MINUTE);
        let report = scheduler.on_alarm(ALARM).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!("soon")]);

        let pending = scheduler.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(h.timer.armed(ALARM).await, Some(pending[0].scheduled_for));
        assert_eq!(scheduler.phase(), SchedulerPhase::Armed);
        let stored: Vec<Task> = get_json(h.store.as_ref(), PENDING_TASKS_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data, json!("later"));

        // Not run again on a spurious early alarm.
        let report = scheduler.on_alarm(ALARM).await.unwrap();
        assert_eq!(report.total(), 0);

        h.clock.advance(10 * MINUTE);
        let report = scheduler.on_alarm(ALARM).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!("soon"), json!("later")]);
        assert!(scheduler.is_empty().await);
    }

    #[tokio::test]
    async fn huge_granularity_saturates_alarm_time() {
        let h = Harness::new();
        let scheduler = Scheduler::new(
            h.store.clone(),
            h.timer.clone(),
            h.clock.clone(),
            ALARM,
            Duration::from_secs(u64::MAX),
        );
        scheduler.add_task("a", json!(null), MINUTE).await.unwrap();
        assert_eq!(h.timer.armed(ALARM).await, Some(DateTime::<Utc>::MAX_UTC));
    }

    #[tokio::test]
    async fn failing_task_is_dropped_and_does_not_block_others() {
        let h = Harness::new();
        let errors = Arc::new(ErrorBuffer::new(h.store.clone(), 10));
        let scheduler = h.scheduler().with_error_buffer(errors.clone());
        let (seen, handler) = recorder();
        scheduler.register_handler("ok", handler);
        scheduler.register_handler(
            "bad",
            Arc::new(|_: Value| async { Err::<(), _>(anyhow::anyhow!("network unreachable")) }),
        );
        scheduler.register_handler(
            "panics",
            Arc::new(|_: Value| async {
                if true {
                    panic!("boom");
                }
                anyhow::Ok(())
            }),
        );

        scheduler.add_task("bad", json!(1), Duration::ZERO).await.unwrap();
        scheduler.add_task("panics", json!(2), Duration::ZERO).await.unwrap();
        scheduler.add_task("ok", json!(3), Duration::ZERO).await.unwrap();
        scheduler.add_task("nobody", json!(4), Duration::ZERO).await.unwrap();

        h.clock.advance(Duration::from_secs(1));
        let report = scheduler.process_due().await.unwrap();

        assert_eq!(report, FireReport { succeeded: 1, failed: 2, unhandled: 1 });
        assert_eq!(*seen.lock().unwrap(), vec![json!(3)]);
        assert!(scheduler.is_empty().await);

        let records = errors.get_error_buffer().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].category, ErrorCategory::Network);
        assert_eq!(records[0].context_tag, "task:bad");
    }

    #[tokio::test]
    async fn queue_is_persisted_on_every_mutation() {
        let h = Harness::new();
        let scheduler = h.scheduler();
        scheduler.add_task("a", json!({"n": 1}), MINUTE).await.unwrap();

        let persisted: Vec<Task> = get_json(h.store.as_ref(), PENDING_TASKS_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted, scheduler.pending().await);
    }

    #[tokio::test]
    async fn failed_persist_leaves_memory_unchanged() {
        let h = Harness::new();
        let flaky = Arc::new(FlakyStore::new(h.store.clone()));
        let scheduler = Scheduler::new(flaky.clone(), h.timer.clone(), h.clock.clone(), ALARM, MINUTE);

        flaky.fail_next_writes(1);
        assert!(scheduler.add_task("a", json!(null), MINUTE).await.is_err());
        assert!(scheduler.is_empty().await);
        assert_eq!(h.timer.armed_count(), 0);
    }

    #[tokio::test]
    async fn repeated_init_never_duplicates_tasks_or_firings() {
        let h = Harness::new();
        {
            let first_life = h.scheduler();
            for i in 0..3 {
                first_life.add_task("job", json!(i), MINUTE).await.unwrap();
            }
        }

        // Worker restarted: fresh scheduler over the same store.
        let scheduler = h.scheduler();
        let (seen, handler) = recorder();
        scheduler.register_handler("job", handler);
        scheduler.init().await.unwrap();
        scheduler.init().await.unwrap();
        assert_eq!(scheduler.len().await, 3);
        assert_eq!(h.timer.armed_count(), 1);

        h.clock.advance(2 * MINUTE);
        scheduler.on_alarm(ALARM).await.unwrap();
        scheduler.init().await.unwrap();
        scheduler.on_alarm(ALARM).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);
        assert!(scheduler.is_empty().await);
    }

    #[tokio::test]
    async fn corrupt_queue_is_reported() {
        let h = Harness::new();
        h.store
            .set(PENDING_TASKS_KEY, &json!({"not": "a list"}))
            .await
            .unwrap();
        let err = h.scheduler().init().await.unwrap_err();
        assert!(matches!(err, SchedulerError::CorruptQueue(_)));
    }

    #[tokio::test]
    async fn foreign_alarms_are_ignored() {
        let h = Harness::new();
        let scheduler = h.scheduler();
        let (seen, handler) = recorder();
        scheduler.register_handler("job", handler);
        scheduler.add_task("job", json!(1), Duration::ZERO).await.unwrap();

        h.clock.advance(MINUTE);
        let report = scheduler.on_alarm("someone-else").await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_can_reschedule_itself() {
        let h = Harness::new();
        let scheduler = Arc::new(h.scheduler());
        let weak = Arc::downgrade(&scheduler);
        scheduler.register_handler(
            "heartbeat",
            Arc::new(move |data: Value| {
                let weak = weak.clone();
                async move {
                    if let Some(scheduler) = weak.upgrade() {
                        let n = data.as_u64().unwrap_or(0);
                        if n < 1 {
                            scheduler.add_task("heartbeat", json!(n + 1), MINUTE).await?;
                        }
                    }
                    anyhow::Ok(())
                }
            }),
        );

        scheduler.add_task("heartbeat", json!(0), Duration::ZERO).await.unwrap();
        h.clock.advance(Duration::from_secs(1));
        scheduler.process_due().await.unwrap();

        let pending = scheduler.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].data, json!(1));
        assert_eq!(h.timer.armed(ALARM).await, Some(pending[0].scheduled_for));
    }

    #[tokio::test]
    async fn re_registration_is_observable() {
        let h = Harness::new();
        let scheduler = h.scheduler();
        let (_, first) = recorder();
        let (_, second) = recorder();
        assert!(scheduler.register_handler("job", first).is_none());
        assert!(scheduler.register_handler("job", second).is_some());
        assert!(scheduler.unregister_handler("job").is_some());
    }

    #[tokio::test]
    async fn clear_cancels_alarm() {
        let h = Harness::new();
        let scheduler = h.scheduler();
        scheduler.add_task("a", json!(null), MINUTE).await.unwrap();
        scheduler.clear().await.unwrap();
        assert!(scheduler.is_empty().await);
        assert_eq!(h.timer.armed_count(), 0);
        assert_eq!(scheduler.phase(), SchedulerPhase::Idle);
    }
}
