//! Worker runtime: the per-worker context object.
//!
//! Constructed once per worker instance and handed to whatever needs the
//! core components. Nothing here is global, so independent runtimes (and
//! tests) never share state except through the store they are given.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info};

use crate::bus::{ContextId, LocalHub, Mediator};
use crate::config::RuntimeConfig;
use crate::diagnostics::ErrorBuffer;
use crate::error::{Result, SchedulerError};
use crate::state::PersistentState;
use crate::store::{KvStore, StorageUsage, WriteBatch, storage_usage};
use crate::worker::{Clock, FireReport, Scheduler, WakeTimer};

/// Environment primitives the runtime is built on.
pub struct RuntimeDeps {
    pub store: Arc<dyn KvStore>,
    pub timer: Arc<dyn WakeTimer>,
    pub clock: Arc<dyn Clock>,
    pub hub: Arc<LocalHub>,
}

/// All core components of one worker instance.
pub struct WorkerRuntime {
    config: RuntimeConfig,
    store: Arc<dyn KvStore>,
    hub: Arc<LocalHub>,
    errors: Arc<ErrorBuffer>,
    state: Arc<PersistentState>,
    scheduler: Arc<Scheduler>,
    mediator: Arc<Mediator>,
    writes: Arc<WriteBatch>,
}

impl WorkerRuntime {
    pub fn new(config: RuntimeConfig, deps: RuntimeDeps) -> Self {
        let errors = Arc::new(ErrorBuffer::new(
            Arc::clone(&deps.store),
            config.error_buffer_cap,
        ));
        let state = PersistentState::new(
            Arc::clone(&deps.store),
            Arc::clone(&deps.clock),
            config.state_key.clone(),
            config.state_flush_delay,
        );
        let scheduler = Arc::new(
            Scheduler::new(
                Arc::clone(&deps.store),
                deps.timer,
                deps.clock,
                config.alarm_name.clone(),
                config.timer_granularity,
            )
            .with_error_buffer(Arc::clone(&errors)),
        );
        let mediator = Arc::new(
            Mediator::new(ContextId::worker(), Arc::clone(&deps.hub))
                .with_error_buffer(Arc::clone(&errors)),
        );
        let writes = WriteBatch::new(Arc::clone(&deps.store));
        state.set_error_buffer(Arc::clone(&errors));
        writes.set_error_buffer(Arc::clone(&errors));

        Self {
            config,
            store: deps.store,
            hub: deps.hub,
            errors,
            state,
            scheduler,
            mediator,
            writes,
        }
    }

    /// Worker startup path. Safe to run more than once per worker lifetime.
    ///
    /// Loads persisted state if not yet loaded, rehydrates the task queue,
    /// and starts the inbound message listener.
    pub async fn start(&self) -> Result<()> {
        self.state.snapshot().await?;
        self.scheduler.init().await?;
        self.mediator.listen()?;
        info!(
            alarm = %self.config.alarm_name,
            pending_tasks = self.scheduler.len().await,
            handlers = self.mediator.registered_types().len(),
            "Worker runtime started"
        );
        Ok(())
    }

    /// Handle one fired wake alarm.
    pub async fn on_alarm(&self, name: &str) -> std::result::Result<FireReport, SchedulerError> {
        self.scheduler.on_alarm(name).await
    }

    /// Drive the scheduler from fired alarm names until the channel closes.
    pub async fn run(&self, mut alarms: mpsc::UnboundedReceiver<String>) {
        while let Some(name) = alarms.recv().await {
            if let Err(e) = self.on_alarm(&name).await {
                error!(alarm = %name, error = %e, "Alarm processing failed");
                self.errors.record(&e, "scheduler").await;
            }
        }
        info!("Alarm channel closed, worker runtime stopping");
    }

    /// Flush pending writes and detach from the hub.
    pub async fn shutdown(&self) -> Result<()> {
        self.mediator.stop();
        self.writes.flush().await?;
        self.state.save().await?;
        info!("Worker runtime shut down");
        Ok(())
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<LocalHub> {
        &self.hub
    }

    pub fn errors(&self) -> &Arc<ErrorBuffer> {
        &self.errors
    }

    pub fn state(&self) -> &Arc<PersistentState> {
        &self.state
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn mediator(&self) -> &Arc<Mediator> {
        &self.mediator
    }

    pub fn writes(&self) -> &Arc<WriteBatch> {
        &self.writes
    }

    pub async fn storage_usage(&self) -> Result<StorageUsage> {
        Ok(storage_usage(self.store.as_ref()).await?)
    }
}
