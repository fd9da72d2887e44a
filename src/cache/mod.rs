// Cache module.
// Two-tier cache for API responses: process memory backed by a durable key-value store.

pub mod backend;
pub mod memory;
pub mod paths;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, StorageBackend, StorageError};
pub use memory::{Epoch, QueryCache};
pub use store::{
    CachedData, DEFAULT_MAX_BYTES, DEFAULT_PREFIX, DEFAULT_TTL, PersistentStore, StoreStats,
    format_bytes,
};
