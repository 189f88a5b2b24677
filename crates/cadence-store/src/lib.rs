//! Persistence backends for Cadence.

/// Process-local store with JSON snapshots.
pub mod store;

pub use store::MemoryStore;
