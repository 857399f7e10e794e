//! Durable store: the only storage that survives worker termination.

pub mod batch;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use batch::WriteBatch;
pub use libsql_backend::LibSqlStore;
pub use memory::MemoryStore;
pub use traits::{KvStore, StorageUsage, get_json, set_json, storage_usage};
