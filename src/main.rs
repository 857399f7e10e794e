use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde_json::{Value, json};
use tracing::{info, warn};

use worker_relay::bus::{LocalHub, MessageType, SenderContext};
use worker_relay::config::RuntimeConfig;
use worker_relay::state::{ColdStartCache, DEFAULT_COLD_START_KEY};
use worker_relay::store::LibSqlStore;
use worker_relay::worker::{Clock, SystemClock, TokioWakeTimer};
use worker_relay::{RuntimeDeps, WorkerRuntime};

/// Delay before tracked events are rolled up into the state counters.
const ROLLUP_DELAY: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RuntimeConfig::from_env()?;

    eprintln!("Worker Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Quota: {} bytes", config.storage_quota_bytes);
    eprintln!("   Alarm: {} (granularity {:?})", config.alarm_name, config.timer_granularity);

    // ── Durable store ───────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let store = Arc::new(LibSqlStore::new_local(&config.db_path, config.storage_quota_bytes).await?);

    // ── Runtime ─────────────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (timer, alarms) = TokioWakeTimer::new(Arc::clone(&clock));
    let runtime = WorkerRuntime::new(
        config,
        RuntimeDeps {
            store,
            timer: Arc::new(timer),
            clock,
            hub: Arc::new(LocalHub::new()),
        },
    );

    register_handlers(&runtime);
    runtime.start().await?;

    let usage = runtime.storage_usage().await?;
    eprintln!("   Storage: {:.1}% used\n", usage.percent_used);
    if usage.near_quota {
        warn!(bytes_used = usage.bytes_used, quota = usage.quota_bytes, "Durable store is nearly full");
    }

    tokio::select! {
        _ = runtime.run(alarms) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
        }
    }

    runtime.shutdown().await?;
    Ok(())
}

/// Wire the worker's message and task handlers.
fn register_handlers(runtime: &WorkerRuntime) {
    let mediator = runtime.mediator();
    let state = Arc::clone(runtime.state());
    let scheduler = Arc::clone(runtime.scheduler());
    let writes = Arc::clone(runtime.writes());
    let startup = Arc::new(ColdStartCache::new(
        Arc::clone(runtime.store()),
        DEFAULT_COLD_START_KEY,
    ));

    {
        let state = Arc::clone(&state);
        mediator.register(
            MessageType::GetSettings,
            Arc::new(move |_: Value, _: SenderContext| {
                let state = Arc::clone(&state);
                async move { anyhow::Ok(state.get("settings").await?.unwrap_or_else(|| json!({}))) }
            }),
        );
    }

    {
        let state = Arc::clone(&state);
        let hub_mediator = Arc::downgrade(mediator);
        mediator.register(
            MessageType::SaveSettings,
            Arc::new(move |payload: Value, _: SenderContext| {
                let state = Arc::clone(&state);
                let hub_mediator = hub_mediator.clone();
                async move {
                    let settings = payload
                        .as_object()
                        .context("settings payload must be an object")?;
                    for (key, value) in settings {
                        state.set(&format!("settings.{key}"), value.clone()).await?;
                    }
                    let updated = state.get("settings").await?.unwrap_or_else(|| json!({}));
                    if let Some(mediator) = hub_mediator.upgrade() {
                        mediator
                            .broadcast(MessageType::SettingsUpdated, updated.clone())
                            .await;
                    }
                    anyhow::Ok(json!({ "saved": true, "settings": updated }))
                }
            }),
        );
    }

    {
        let scheduler = Arc::clone(&scheduler);
        let writes = Arc::clone(&writes);
        mediator.register(
            MessageType::TrackEvent,
            Arc::new(move |payload: Value, _: SenderContext| {
                let scheduler = Arc::clone(&scheduler);
                let writes = Arc::clone(&writes);
                async move {
                    let name = payload
                        .get("event")
                        .and_then(Value::as_str)
                        .context("event name is required")?
                        .to_string();
                    writes.set(format!("lastEvent:{name}"), payload.clone());
                    scheduler
                        .add_task("analytics-rollup", json!({ "event": name }), ROLLUP_DELAY)
                        .await?;
                    anyhow::Ok(json!({ "queued": true }))
                }
            }),
        );
    }

    {
        let startup = Arc::clone(&startup);
        mediator.register(
            MessageType::GetFeatureFlags,
            Arc::new(move |_: Value, _: SenderContext| {
                let startup = Arc::clone(&startup);
                async move {
                    let flags: Value = startup
                        .get_or_compute(|| async { Ok(default_feature_flags()) })
                        .await?;
                    anyhow::Ok(flags)
                }
            }),
        );
    }

    {
        let startup = Arc::clone(&startup);
        mediator.register(
            MessageType::ExtensionInstalled,
            Arc::new(move |_: Value, _: SenderContext| {
                let startup = Arc::clone(&startup);
                async move {
                    startup.prime(|| async { Ok(default_feature_flags()) }).await?;
                    anyhow::Ok(json!({ "primed": true }))
                }
            }),
        );
    }

    scheduler.register_handler(
        "analytics-rollup",
        Arc::new(move |data: Value| {
            let state = Arc::clone(&state);
            async move {
                let event = data
                    .get("event")
                    .and_then(Value::as_str)
                    .context("rollup task without event name")?;
                let path = format!("cache.analytics.{event}");
                let count = state.get_as::<u64>(&path).await?.unwrap_or(0);
                state.set(&path, json!(count + 1)).await?;
                anyhow::Ok(())
            }
        }),
    );
}

fn default_feature_flags() -> Value {
    json!({
        "batchWrites": true,
        "responseCache": true,
        "circuitBreaker": true,
    })
}
