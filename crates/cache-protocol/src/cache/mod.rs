//! # Cache Storage
//!
//! Entry metadata, keys and the storage providers the protocol engine
//! reads from and writes into.

mod lock;
pub mod providers;
mod types;

pub use lock::{EntryLock, LockTable};
pub use providers::{CacheReader, CacheSource, CacheWriter, FileCache, MemoryCache, RequestCache};
pub use types::{CacheConfig, CacheEntry, CacheKey, CacheResult, EntryMetadata};
