//! # Cache Provider
//!
//! This module defines the storage contract the protocol engine consumes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

use crate::cache::lock::EntryLock;
use crate::cache::types::{CacheEntry, CacheKey, CacheResult, EntryMetadata};

/// Seekable byte source of a stored entry
pub trait CacheSource: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> CacheSource for T {}

/// Write side of a new entry. Shutting it down commits the entry; dropping it
/// before shutdown discards everything written.
pub type CacheWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte stream of a retrieved entry, holding the entry lock until unlocked.
pub struct CacheReader {
    source: Box<dyn CacheSource>,
    lock: Option<EntryLock>,
}

impl CacheReader {
    pub fn new(source: impl CacheSource + 'static, lock: Option<EntryLock>) -> Self {
        Self {
            source: Box::new(source),
            lock,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub(crate) fn release_lock(&mut self) {
        self.lock = None;
    }
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader")
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for CacheReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.source).poll_read(cx, buf)
    }
}

impl AsyncSeek for CacheReader {
    fn start_seek(mut self: Pin<&mut Self>, position: io::SeekFrom) -> io::Result<()> {
        Pin::new(&mut *self.source).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut *self.source).poll_complete(cx)
    }
}

/// A storage backend for request caching, shared by many concurrent requests.
#[async_trait]
pub trait RequestCache: Send + Sync {
    /// Whether entries of this cache belong to a single user
    fn is_private(&self) -> bool;

    /// Look up an entry and lock it for reading
    async fn retrieve(&self, key: &CacheKey) -> CacheResult<Option<(CacheEntry, CacheReader)>>;

    /// Open a write stream for a new entry replacing whatever is stored under `key`
    async fn store(
        &self,
        key: &CacheKey,
        content_length: Option<u64>,
        metadata: EntryMetadata,
    ) -> CacheResult<CacheWriter>;

    /// Refresh the metadata of an existing entry.
    ///
    /// There is no check that the stored entry is still the one a caller read earlier.
    async fn update(&self, key: &CacheKey, metadata: EntryMetadata) -> CacheResult<()>;

    /// Delete an entry
    async fn remove(&self, key: &CacheKey) -> CacheResult<()>;

    /// Release the lock of a retrieved entry so it may be replaced
    fn unlock(&self, reader: &mut CacheReader) {
        reader.release_lock();
    }
}
