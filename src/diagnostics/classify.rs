//! Keyword-based error classification.
//!
//! Transport and host errors carry no reliable structure, so categories are
//! assigned from the message text. The first matching category wins.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    Network,
    Storage,
    /// Domain-specific pattern errors, passed through untouched.
    Pattern,
    Permission,
    /// The host tore down or rejected an operation.
    RuntimeLifecycle,
    UserInput,
    Unknown,
}

/// Ordered keyword table. Earlier rows take precedence.
const RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Network,
        &["network", "fetch", "timeout", "timed out", "connection refused", "dns"],
    ),
    (
        ErrorCategory::Storage,
        &["storage", "quota", "database", "disk full"],
    ),
    (
        ErrorCategory::Pattern,
        &["invalid regular expression", "regex", "pattern"],
    ),
    (
        ErrorCategory::Permission,
        &["permission", "not allowed", "forbidden", "unauthorized", "access denied"],
    ),
    (
        ErrorCategory::RuntimeLifecycle,
        &[
            "extension context",
            "context invalidated",
            "manifest",
            "receiving end does not exist",
            "worker terminated",
            "shut down",
            "channel closed",
        ],
    ),
    (
        ErrorCategory::UserInput,
        &["invalid input", "validation", "required field", "must be"],
    ),
];

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Pattern => "pattern",
            Self::Permission => "permission",
            Self::RuntimeLifecycle => "runtime-lifecycle",
            Self::UserInput => "user-input",
            Self::Unknown => "unknown",
        }
    }

    /// Terminal outcome shown to end users. Never exposes the category name.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Network | Self::Storage | Self::Unknown => "Failed, try again",
            Self::Permission | Self::RuntimeLifecycle => "Feature unavailable",
            Self::Pattern | Self::UserInput => "Please check your input and try again",
        }
    }

    /// Whether retrying the same operation can plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Permission | Self::Pattern | Self::UserInput)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error message.
pub fn classify(message: &str) -> ErrorCategory {
    let message = message.to_lowercase();
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| message.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Classify anything printable, including `anyhow::Error` and std errors.
pub fn classify_error<E: fmt::Display + ?Sized>(error: &E) -> ErrorCategory {
    classify(&error.to_string())
}

/// An error that has been through classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ClassifiedError {
    pub message: String,
    pub category: ErrorCategory,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl ClassifiedError {
    /// Classify `error` by its message.
    pub fn from_display<E: fmt::Display + ?Sized>(error: &E) -> Self {
        Self::new(error.to_string(), classify_error(error))
    }

    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category,
            timestamp: Utc::now(),
            recoverable: category.is_recoverable(),
        }
    }
}
