//! Message handlers and interceptors.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::bus::message::{Message, SenderContext};

/// Handles one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Value, sender: &SenderContext) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Value, SenderContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn handle(&self, payload: Value, sender: &SenderContext) -> anyhow::Result<Value> {
        (self)(payload, sender.clone()).await
    }
}

/// Synchronous pre-dispatch check. Returning `false` blocks the message.
pub type Interceptor = Arc<dyn Fn(&Message, &SenderContext) -> bool + Send + Sync>;
