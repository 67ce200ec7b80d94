//! # Cache Types
//!
//! Entry metadata and keys shared by the storage providers and the validators.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache key for identifying a stored response
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Absolute URI of the resource
    pub uri: String,
}

impl CacheKey {
    /// Create a new cache key
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// Convert to a filename-safe string
    pub fn to_filename(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.uri.as_bytes());
        let hash = hasher.finalize();
        format!("{hash:x}")
    }
}

impl From<&url::Url> for CacheKey {
    fn from(url: &url::Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self::new(url.as_str())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Metadata of a stored response. The bytes live in the storage backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Entry belongs to a single-user cache
    pub is_private: bool,
    /// Number of body bytes held by the storage backend
    pub stream_size: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub last_synchronized_at: Option<DateTime<Utc>>,
    /// Staleness the storing client was willing to accept
    pub max_stale: Option<Duration>,
    pub hit_count: u64,
    pub usage_count: u64,
    /// Entry holds only a prefix of the resource
    pub is_partial: bool,
    /// Raw "Name: value" lines, status line first
    pub entry_headers: Vec<String>,
    /// Internal key/value pairs with lowercase keys
    pub system_metadata: BTreeMap<String, String>,
}

impl CacheEntry {
    /// Create an empty entry used when nothing is stored for a key
    pub fn new(is_private: bool) -> Self {
        Self {
            is_private,
            ..Default::default()
        }
    }

    /// Apply the store/update metadata bundle to this entry
    pub fn apply(&mut self, metadata: &EntryMetadata) {
        self.expires_at = metadata.expires_at;
        self.last_modified_at = metadata.last_modified_at;
        self.last_synchronized_at = metadata.last_synchronized_at;
        self.max_stale = metadata.max_stale;
        if let Some(headers) = &metadata.entry_headers {
            self.entry_headers = headers.clone();
        }
        if let Some(system_metadata) = &metadata.system_metadata {
            self.system_metadata = system_metadata.clone();
        }
    }
}

/// Attributes passed to the storage backend on store and update.
///
/// `None` headers or system metadata leave the stored values untouched on update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryMetadata {
    pub expires_at: Option<DateTime<Utc>>,
    pub last_modified_at: Option<DateTime<Utc>>,
    pub last_synchronized_at: Option<DateTime<Utc>>,
    pub max_stale: Option<Duration>,
    pub entry_headers: Option<Vec<String>>,
    pub system_metadata: Option<BTreeMap<String, String>>,
}

impl EntryMetadata {
    /// Snapshot an entry, optionally leaving its header block out
    pub fn from_entry(entry: &CacheEntry, include_headers: bool) -> Self {
        Self {
            expires_at: entry.expires_at,
            last_modified_at: entry.last_modified_at,
            last_synchronized_at: entry.last_synchronized_at,
            max_stale: entry.max_stale,
            entry_headers: include_headers.then(|| entry.entry_headers.clone()),
            system_metadata: include_headers.then(|| entry.system_metadata.clone()),
        }
    }
}

/// Configuration for the storage providers
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Path for disk cache storage
    pub disk_cache_path: Option<PathBuf>,
    /// Maximum size of memory cache in bytes
    pub max_memory_cache_size: u64,
    /// Largest body a provider keeps; bigger writes are discarded at commit
    pub max_entry_size: u64,
    /// Whether entries are private to a single user
    pub private: bool,
}

impl CacheConfig {
    /// Directory used by the file cache
    pub fn cache_dir(&self) -> PathBuf {
        self.disk_cache_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cache-protocol"))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disk_cache_path: None,
            max_memory_cache_size: 64 * 1024 * 1024, // 64MB
            max_entry_size: 16 * 1024 * 1024,        // 16MB
            private: true,
        }
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, std::io::Error>;
