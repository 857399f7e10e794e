//! In-process cross-context transport.
//!
//! Each live context owns one inbound channel. A delivery carries a
//! `oneshot` reply sender, so the receiving side can answer at most once.
//! A missing context, a closed inbound channel, or a reply sender dropped
//! without answering all surface as [`TransportError::PeerGone`].
//!
//! Long-lived named connections ([`Port`]s) are opened through the same hub
//! and handed to the single port listener.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::bus::message::{ContextId, Message, Reply, SenderContext};
use crate::bus::port::Port;
use crate::error::TransportError;

/// Default inbound channel capacity per context.
const DEFAULT_INBOUND_CAPACITY: usize = 64;

/// One message waiting to be handled by a context.
pub struct Inbound {
    pub message: Message,
    pub sender: SenderContext,
    pub reply: oneshot::Sender<Reply>,
}

/// Routes messages between the contexts attached to it.
pub struct LocalHub {
    contexts: RwLock<HashMap<ContextId, mpsc::Sender<Inbound>>>,
    port_listener: RwLock<Option<mpsc::Sender<Port>>>,
    capacity: usize,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOUND_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            contexts: RwLock::new(HashMap::new()),
            port_listener: RwLock::new(None),
            capacity: capacity.max(1),
        }
    }

    /// Attach a context and return its inbound receiver.
    ///
    /// A context whose previous receiver was dropped may attach again.
    pub fn attach(&self, id: ContextId) -> Result<mpsc::Receiver<Inbound>, TransportError> {
        let mut contexts = self.contexts.write().unwrap_or_else(|e| e.into_inner());
        if contexts.get(&id).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::AlreadyAttached {
                context: id.to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        debug!(context = %id, "Context attached");
        contexts.insert(id, tx);
        Ok(rx)
    }

    /// Detach a context. In-flight deliveries to it resolve as peer-gone.
    pub fn detach(&self, id: &ContextId) -> bool {
        let removed = self
            .contexts
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some();
        if removed {
            debug!(context = %id, "Context detached");
        }
        removed
    }

    /// Contexts with a live inbound channel, in id order.
    pub fn live_contexts(&self) -> Vec<ContextId> {
        let contexts = self.contexts.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<ContextId> = contexts
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_live(&self, id: &ContextId) -> bool {
        self.contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Deliver `message` from `from` to `to` and wait for the single reply.
    pub async fn deliver(
        &self,
        from: &ContextId,
        to: &ContextId,
        message: Message,
    ) -> Result<Reply, TransportError> {
        let peer_gone = || TransportError::PeerGone {
            context: to.to_string(),
        };
        let tx = self
            .contexts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(to)
            .cloned()
            .ok_or_else(peer_gone)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let inbound = Inbound {
            sender: SenderContext {
                context_id: from.clone(),
                correlation_id: message.correlation_id.clone(),
            },
            message,
            reply: reply_tx,
        };
        tx.send(inbound).await.map_err(|_| peer_gone())?;
        reply_rx.await.map_err(|_| peer_gone())
    }

    /// Become the port listener. Incoming connections arrive on the receiver.
    ///
    /// Only one listener may be live at a time.
    pub fn accept_ports(&self) -> Result<mpsc::Receiver<Port>, TransportError> {
        let mut listener = self.port_listener.write().unwrap_or_else(|e| e.into_inner());
        if listener.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::AlreadyAttached {
                context: "port listener".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        *listener = Some(tx);
        Ok(rx)
    }

    /// Open a named connection to the port listener.
    pub async fn connect_port(&self, name: &str) -> Result<Port, TransportError> {
        let peer_gone = || TransportError::PeerGone {
            context: format!("port {name}"),
        };
        let listener = self
            .port_listener
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(peer_gone)?;

        let (local, remote) = Port::pair(name, self.capacity);
        listener.send(remote).await.map_err(|_| peer_gone())?;
        debug!(port = %name, "Port connected");
        Ok(local)
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}
