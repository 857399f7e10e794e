//! Wire message model and the closed message-type registry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::DispatchError;

/// Every message type the mediator can route.
///
/// On the wire the type travels as a string; strings outside this set are
/// rejected at dispatch with [`DispatchError::UnknownType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Pattern execution
    ExecuteRegex,
    RegexResult,
    ValidatePattern,

    // Settings
    GetSettings,
    SaveSettings,
    SettingsUpdated,

    // Saved patterns
    SavePattern,
    DeletePattern,
    GetPatterns,
    PatternsUpdated,

    // Licensing and flags
    CheckLicense,
    LicenseStatus,
    GetFeatureFlags,

    TrackEvent,

    // Lifecycle
    ExtensionInstalled,
    ExtensionUpdated,
}

impl MessageType {
    pub const ALL: [MessageType; 16] = [
        Self::ExecuteRegex,
        Self::RegexResult,
        Self::ValidatePattern,
        Self::GetSettings,
        Self::SaveSettings,
        Self::SettingsUpdated,
        Self::SavePattern,
        Self::DeletePattern,
        Self::GetPatterns,
        Self::PatternsUpdated,
        Self::CheckLicense,
        Self::LicenseStatus,
        Self::GetFeatureFlags,
        Self::TrackEvent,
        Self::ExtensionInstalled,
        Self::ExtensionUpdated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecuteRegex => "EXECUTE_REGEX",
            Self::RegexResult => "REGEX_RESULT",
            Self::ValidatePattern => "VALIDATE_PATTERN",
            Self::GetSettings => "GET_SETTINGS",
            Self::SaveSettings => "SAVE_SETTINGS",
            Self::SettingsUpdated => "SETTINGS_UPDATED",
            Self::SavePattern => "SAVE_PATTERN",
            Self::DeletePattern => "DELETE_PATTERN",
            Self::GetPatterns => "GET_PATTERNS",
            Self::PatternsUpdated => "PATTERNS_UPDATED",
            Self::CheckLicense => "CHECK_LICENSE",
            Self::LicenseStatus => "LICENSE_STATUS",
            Self::GetFeatureFlags => "GET_FEATURE_FLAGS",
            Self::TrackEvent => "TRACK_EVENT",
            Self::ExtensionInstalled => "EXTENSION_INSTALLED",
            Self::ExtensionUpdated => "EXTENSION_UPDATED",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DispatchError::UnknownType { kind: s.to_string() })
    }
}

/// Identifies one execution context on the hub.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(String);

impl ContextId {
    pub const WORKER: &'static str = "worker";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The background worker, the implicit destination of `send`.
    pub fn worker() -> Self {
        Self(Self::WORKER.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A message as it travels between contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Message {
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self::raw(kind.as_str(), payload)
    }

    /// Build a message from an arbitrary type string.
    pub fn raw(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Assign a fresh correlation id unless one is already set.
    pub fn ensure_correlation_id(&mut self) -> &str {
        self.correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
    }

    pub fn message_type(&self) -> Result<MessageType, DispatchError> {
        self.kind.parse()
    }
}

/// Who sent an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderContext {
    pub context_id: ContextId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Outcome of a delivered message: the handler's value or a structured failure.
pub type Reply = Result<Value, DispatchError>;

/// One destination's outcome in a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastOutcome {
    pub context_id: ContextId,
    pub result: Reply,
}
