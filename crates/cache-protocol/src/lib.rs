//! # Cache Protocol
//!
//! A request cache validation engine for HTTP and FTP responses.
//! Decides per request whether a stored response may be served, must be
//! revalidated, merged with a partial live response, stored, refreshed or
//! evicted, and assembles the body stream handed to the caller.
//!
//! ## Features
//!
//! - RFC 2616 freshness, conditional requests, Vary and partial content rules
//! - FTP rules for direct and HTTP-proxied transfers
//! - Memory (moka) and file storage backends with per-entry locking
//! - Stream combinators for tee-to-cache, cached-head-plus-live-tail and
//!   ranged reads of stored entries
//! - A caching client over reqwest

pub mod builder;
pub mod bytes_stream;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod policy;
pub mod protocol;
pub mod stream;
pub mod validator;

pub use builder::ProtocolConfigBuilder;
pub use cache::{CacheConfig, CacheEntry, CacheKey, FileCache, MemoryCache, RequestCache};
pub use client::{CachedBody, CachingClient, HttpTransport, ReqwestTransport};
pub use config::ProtocolConfig;
pub use error::CacheError;
pub use message::{CacheRequest, CacheResponse};
pub use policy::{CacheLevel, CachePolicy};
pub use protocol::ProtocolEngine;
pub use validator::{
    CacheValidator, FreshnessStatus, FtpValidator, HttpValidator, ValidationStatus,
};
