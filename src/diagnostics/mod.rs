//! Error classification, the persisted error buffer, and background task
//! supervision.

pub mod buffer;
pub mod classify;
pub mod supervise;

pub use buffer::{ERROR_BUFFER_KEY, ErrorBuffer, ErrorRecord};
pub use classify::{ClassifiedError, ErrorCategory, classify, classify_error};
pub use supervise::{ErrorSink, panic_message, spawn_recorded};
