//! Persistent state cache and cold-start cache.

pub mod cold_start;
pub mod persistent;

pub use cold_start::{ColdStartCache, DEFAULT_COLD_START_KEY};
pub use persistent::{DEFAULT_FLUSH_DELAY, DEFAULT_STATE_KEY, PersistentState, default_tree};
