//! Named long-lived connections between contexts.
//!
//! A [`Port`] is one end of a bidirectional message stream. The
//! [`PortManager`] keeps the ports it has opened or accepted by name so
//! other code can post to them, and drops an entry as soon as the far end
//! disconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::message::Message;
use crate::bus::transport::LocalHub;
use crate::error::TransportError;

/// One end of a named connection. Dropping it disconnects.
#[derive(Debug)]
pub struct Port {
    name: String,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
}

impl Port {
    /// Two connected ends sharing `name`.
    pub(crate) fn pair(name: &str, capacity: usize) -> (Port, Port) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Port {
                name: name.to_string(),
                tx: a_tx,
                rx: b_rx,
            },
            Port {
                name: name.to_string(),
                tx: b_tx,
                rx: a_rx,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send to the far end.
    pub async fn post(&self, message: Message) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::PeerGone {
                context: format!("port {}", self.name),
            })
    }

    /// Next message from the far end. `None` once it has disconnected.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Whether the far end is still receiving.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct Entry {
    id: u64,
    tx: mpsc::Sender<Message>,
}

#[derive(Default)]
struct PortTable {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl PortTable {
    /// Track `tx` under `name` until its receiver goes away.
    fn register(self: &Arc<Self>, name: &str, tx: mpsc::Sender<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let watch = tx.clone();
        let previous = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Entry { id, tx });
        if previous.is_some() {
            warn!(port = %name, "Port name reused, replacing previous connection");
        }

        let table = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            watch.closed().await;
            let mut entries = table.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.get(&name).is_some_and(|entry| entry.id == id) {
                entries.remove(&name);
                debug!(port = %name, "Port disconnected");
            }
        });
    }
}

/// Registry of open ports, keyed by name.
#[derive(Default)]
pub struct PortManager {
    table: Arc<PortTable>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl PortManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept incoming connections from `hub`, calling `on_connect` for each.
    pub fn listen<F>(&self, hub: &LocalHub, on_connect: F) -> Result<(), TransportError>
    where
        F: Fn(Port) + Send + Sync + 'static,
    {
        let mut incoming = hub.accept_ports()?;
        let table = Arc::clone(&self.table);
        let handle = tokio::spawn(async move {
            while let Some(port) = incoming.recv().await {
                debug!(port = %port.name, "Port accepted");
                table.register(&port.name, port.tx.clone());
                on_connect(port);
            }
        });
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Open a named connection to the listener on `hub` and track it.
    pub async fn connect(&self, hub: &LocalHub, name: &str) -> Result<Port, TransportError> {
        let port = hub.connect_port(name).await?;
        self.table.register(name, port.tx.clone());
        Ok(port)
    }

    /// Post to a tracked port. Returns `false` if no such port is connected.
    pub async fn send(&self, name: &str, message: Message) -> bool {
        let tx = self
            .table
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|entry| entry.tx.clone());
        match tx {
            Some(tx) => tx.send(message).await.is_ok(),
            None => {
                debug!(port = %name, "No such port");
                false
            }
        }
    }

    /// Stop tracking a port. The far end sees a disconnect once every
    /// local handle to it is gone.
    pub fn disconnect(&self, name: &str) -> bool {
        self.table
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    /// Names of connected ports, sorted.
    pub fn active_connections(&self) -> Vec<String> {
        let entries = self.table.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| !entry.tx.is_closed())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl Drop for PortManager {
    fn drop(&mut self) {
        if let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            listener.abort();
        }
    }
}
