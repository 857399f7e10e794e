//! Error types for the worker relay.

use serde::{Deserialize, Serialize};

/// Top-level error type for the worker runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Resilience error: {0}")]
    Resilience(#[from] ResilienceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage backend unavailable: {0}")]
    Backend(String),

    #[error("Storage query failed: {0}")]
    Query(String),

    #[error("Storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: u64, quota: u64 },

    #[error("Storage serialization error: {0}")]
    Serialization(String),

    #[error("Storage migration failed: {0}")]
    Migration(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Persistent state cache errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Invalid state path: '{path}'")]
    InvalidPath { path: String },

    #[error("State value at '{path}' has unexpected shape: {reason}")]
    Decode { path: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Task scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Persisted task queue is corrupt: {0}")]
    CorruptQueue(String),

    #[error("Wake timer failure: {0}")]
    Timer(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Cross-context transport errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The destination has no live listener, or tore down mid-call.
    #[error("Could not establish connection to {context}: receiving end does not exist")]
    PeerGone { context: String },

    #[error("Inbound channel for {context} is already attached")]
    AlreadyAttached { context: String },
}

/// Structured failure delivered back to the sender of a message.
///
/// This travels over the transport, so it is serializable and carries
/// only strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum DispatchError {
    #[error("No handler registered for message type '{kind}'")]
    UnknownType { kind: String },

    #[error("Blocked by interceptor")]
    Blocked,

    #[error("Handler for '{kind}' failed: {message}")]
    Handler { kind: String, message: String },
}

/// Errors from the standalone resilience combinators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResilienceError {
    #[error("Batch call failed: {0}")]
    BatchFailed(String),

    #[error("Batch call returned no result for position {index}")]
    BatchResultMissing { index: usize },

    #[error("Batch was dropped before completing")]
    BatchDropped,
}

/// Result type alias for the worker runtime.
pub type Result<T> = std::result::Result<T, Error>;
