//! Message bus: typed routing between isolated execution contexts.

pub mod handler;
pub mod mediator;
pub mod message;
pub mod port;
pub mod transport;

pub use handler::{Interceptor, MessageHandler};
pub use mediator::Mediator;
pub use message::{BroadcastOutcome, ContextId, Message, MessageType, Reply, SenderContext};
pub use port::{Port, PortManager};
pub use transport::{Inbound, LocalHub};
