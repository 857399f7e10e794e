//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default durable-store quota: the 10 MiB local storage cap of the host.
pub const DEFAULT_QUOTA_BYTES: u64 = 10 * 1024 * 1024;

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path of the libSQL database backing the durable store.
    pub db_path: PathBuf,
    /// Byte quota enforced by the durable store.
    pub storage_quota_bytes: u64,
    /// Durable key holding the persistent state tree.
    pub state_key: String,
    /// Quiet period before a state mutation is flushed to disk.
    pub state_flush_delay: Duration,
    /// Name of the single wake alarm used by the task scheduler.
    pub alarm_name: String,
    /// Minimum delay the wake timer can be armed for.
    pub timer_granularity: Duration,
    /// Maximum number of records kept in the error buffer.
    pub error_buffer_cap: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/relay.db"),
            storage_quota_bytes: DEFAULT_QUOTA_BYTES,
            state_key: "appState".to_string(),
            state_flush_delay: Duration::from_secs(1),
            alarm_name: "task-processor".to_string(),
            timer_granularity: Duration::from_secs(60), // 1 minute
            error_buffer_cap: 100,
        }
    }
}

impl RuntimeConfig {
    /// Build a config from `RELAY_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            db_path: std::env::var("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            storage_quota_bytes: parse_env("RELAY_STORAGE_QUOTA_BYTES")?
                .unwrap_or(defaults.storage_quota_bytes),
            state_key: std::env::var("RELAY_STATE_KEY").unwrap_or(defaults.state_key),
            state_flush_delay: parse_env("RELAY_STATE_FLUSH_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.state_flush_delay),
            alarm_name: std::env::var("RELAY_ALARM_NAME").unwrap_or(defaults.alarm_name),
            timer_granularity: parse_env("RELAY_TIMER_GRANULARITY_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timer_granularity),
            error_buffer_cap: parse_env::<usize>("RELAY_ERROR_BUFFER_CAP")?
                .map(|cap| cap.max(1))
                .unwrap_or(defaults.error_buffer_cap),
        })
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
