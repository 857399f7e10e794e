//! Message mediator: typed request/response and broadcast routing.
//!
//! One inbound listener per context multiplexes every message type.
//! Dispatch is a map lookup on [`MessageType`]. Every delivered message gets
//! exactly one reply: the handler's value or a structured [`DispatchError`].
//! Undeliverable messages resolve to `None`, never to an error.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use futures::FutureExt;
use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, debug_span, error, info, warn};

use crate::bus::handler::{Interceptor, MessageHandler};
use crate::bus::message::{BroadcastOutcome, ContextId, Message, MessageType, Reply, SenderContext};
use crate::bus::transport::{Inbound, LocalHub};
use crate::diagnostics::ErrorBuffer;
use crate::error::{DispatchError, TransportError};

/// Routes messages for one context.
pub struct Mediator {
    context_id: ContextId,
    hub: Arc<LocalHub>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    interceptors: RwLock<Vec<Interceptor>>,
    errors: Option<Arc<ErrorBuffer>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Mediator {
    pub fn new(context_id: ContextId, hub: Arc<LocalHub>) -> Self {
        Self {
            context_id,
            hub,
            handlers: RwLock::new(HashMap::new()),
            interceptors: RwLock::new(Vec::new()),
            errors: None,
            listener: Mutex::new(None),
        }
    }

    /// Record handler failures into `errors`.
    pub fn with_error_buffer(mut self, errors: Arc<ErrorBuffer>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn context_id(&self) -> &ContextId {
        &self.context_id
    }

    /// Register the handler for `kind`, returning the one it replaced.
    pub fn register(
        &self,
        kind: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, handler);
        if previous.is_some() {
            warn!(context = %self.context_id, kind = %kind, "Message handler re-registered, previous handler replaced");
        } else {
            debug!(context = %self.context_id, kind = %kind, "Registered message handler");
        }
        previous
    }

    /// Remove the handler for `kind`. Affects subsequent messages only.
    pub fn unregister(&self, kind: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind)
    }

    /// Append an interceptor. Interceptors run in insertion order.
    pub fn add_interceptor<F>(&self, interceptor: F)
    where
        F: Fn(&Message, &SenderContext) -> bool + Send + Sync + 'static,
    {
        self.interceptors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(interceptor));
    }

    pub fn registered_types(&self) -> Vec<MessageType> {
        let mut kinds: Vec<MessageType> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        kinds.sort();
        kinds
    }

    fn handler(&self, kind: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned()
    }

    /// Attach to the hub and start the single inbound listener.
    ///
    /// Calling `listen` again while already listening is a no-op.
    pub fn listen(self: &Arc<Self>) -> Result<(), TransportError> {
        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if listener.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let mut inbound_rx = self.hub.attach(self.context_id.clone())?;
        let weak = Arc::downgrade(self);
        let context_id = self.context_id.clone();
        *listener = Some(tokio::spawn(async move {
            while let Some(inbound) = inbound_rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                // Each message is handled independently so a slow handler
                // never holds up the listener.
                tokio::spawn(async move { this.answer(inbound).await });
            }
            debug!(context = %context_id, "Listener stopped");
        }));
        info!(context = %self.context_id, "Mediator listening");
        Ok(())
    }

    /// Stop listening and detach from the hub.
    pub fn stop(&self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
        self.hub.detach(&self.context_id);
    }

    async fn answer(&self, inbound: Inbound) {
        let Inbound {
            message,
            sender,
            reply,
        } = inbound;
        let span = debug_span!(
            "dispatch",
            kind = %message.kind,
            correlation_id = message.correlation_id.as_deref().unwrap_or(""),
            from = %sender.context_id,
        );
        let outcome = self.dispatch(message, sender).instrument(span).await;
        if reply.send(outcome).is_err() {
            debug!(context = %self.context_id, "Sender went away before the reply");
        }
    }

    /// Route one message to its handler and produce the reply.
    pub async fn dispatch(&self, message: Message, sender: SenderContext) -> Reply {
        let kind = message.message_type()?;
        let handler = self.handler(kind).ok_or_else(|| DispatchError::UnknownType {
            kind: message.kind.clone(),
        })?;

        let interceptors = self
            .interceptors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if !interceptors.iter().all(|allow| allow(&message, &sender)) {
            debug!(kind = %kind, "Message blocked by interceptor");
            return Err(DispatchError::Blocked);
        }

        let outcome = AssertUnwindSafe(handler.handle(message.payload, &sender))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(value)) => {
                debug!(kind = %kind, "Message handled");
                Ok(value)
            }
            Ok(Err(e)) => {
                warn!(kind = %kind, error = %e, "Message handler failed");
                if let Some(errors) = &self.errors {
                    errors.record(&e, kind.as_str()).await;
                }
                Err(DispatchError::Handler {
                    kind: kind.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                error!(kind = %kind, "Message handler panicked");
                if let Some(errors) = &self.errors {
                    errors.record("message handler panicked", kind.as_str()).await;
                }
                Err(DispatchError::Handler {
                    kind: kind.to_string(),
                    message: "handler panicked".to_string(),
                })
            }
        }
    }

    /// Send to the background worker.
    ///
    /// `None` means the message could not be delivered.
    pub async fn send(&self, kind: MessageType, payload: Value) -> Option<Reply> {
        self.send_message(&ContextId::worker(), Message::new(kind, payload))
            .await
    }

    /// Send to one context. `None` if it has no live listener.
    pub async fn send_to_context(
        &self,
        to: &ContextId,
        kind: MessageType,
        payload: Value,
    ) -> Option<Reply> {
        self.send_message(to, Message::new(kind, payload)).await
    }

    /// Send a prebuilt message, which may carry any type string.
    pub async fn send_message(&self, to: &ContextId, mut message: Message) -> Option<Reply> {
        let correlation_id = message.ensure_correlation_id().to_string();
        let kind = message.kind.clone();
        match self.hub.deliver(&self.context_id, to, message).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!(
                    to = %to,
                    kind = %kind,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Message not delivered"
                );
                None
            }
        }
    }

    /// Fan out to every live context except this one.
    ///
    /// Unreachable contexts are left out of the result.
    pub async fn broadcast(&self, kind: MessageType, payload: Value) -> Vec<BroadcastOutcome> {
        let targets: Vec<ContextId> = self
            .hub
            .live_contexts()
            .into_iter()
            .filter(|id| *id != self.context_id)
            .collect();

        let deliveries = targets.into_iter().map(|context_id| {
            let message = Message::new(kind, payload.clone());
            async move {
                self.send_message(&context_id, message)
                    .await
                    .map(|result| BroadcastOutcome { context_id, result })
            }
        });
        let outcomes: Vec<BroadcastOutcome> = join_all(deliveries).await.into_iter().flatten().collect();
        debug!(kind = %kind, delivered = outcomes.len(), "Broadcast complete");
        outcomes
    }
}

impl Drop for Mediator {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}
