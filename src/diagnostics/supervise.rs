//! Background task supervision.
//!
//! Work spawned outside a request (debounced flushes, the alarm loop) has no
//! caller to hand a failure to. Tasks started through [`spawn_recorded`] have
//! their panics caught and written to the error buffer instead of vanishing
//! with the task.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::error;

use crate::diagnostics::buffer::ErrorBuffer;

/// Late-bound error buffer for components that spawn their own tasks.
#[derive(Default)]
pub struct ErrorSink(OnceLock<Arc<ErrorBuffer>>);

impl ErrorSink {
    /// Attach a buffer. Returns `false` if one was already attached.
    pub fn attach(&self, errors: Arc<ErrorBuffer>) -> bool {
        self.0.set(errors).is_ok()
    }

    pub fn get(&self) -> Option<Arc<ErrorBuffer>> {
        self.0.get().cloned()
    }
}

/// Spawn `fut`, recording a panic under `context` when `errors` is set.
///
/// Aborting the returned handle cancels `fut` as with `tokio::spawn`.
pub fn spawn_recorded<F>(
    errors: Option<Arc<ErrorBuffer>>,
    context: impl Into<String>,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let context = context.into();
    tokio::spawn(async move {
        if let Err(payload) = AssertUnwindSafe(fut).catch_unwind().await {
            let message = format!("background task panicked: {}", panic_message(&*payload));
            error!(context = %context, "{message}");
            if let Some(errors) = errors {
                errors.record(&message, &context).await;
            }
        }
    })
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
