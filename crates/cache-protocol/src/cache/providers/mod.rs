//! # Cache Providers
//!
//! This module contains different cache provider implementations.

pub use self::file::FileCache;
pub use self::memory::MemoryCache;
pub use self::provider::{CacheReader, CacheSource, CacheWriter, RequestCache};

// Provider interface
pub mod provider;

// Individual provider implementations
pub mod file;
pub mod memory;
