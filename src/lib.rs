//! Worker Relay: durable task and message coordination for a terminable
//! background worker.

pub mod bus;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod resilience;
pub mod runtime;
pub mod state;
pub mod store;
pub mod worker;

pub use error::{Error, Result};
pub use runtime::{RuntimeDeps, WorkerRuntime};
