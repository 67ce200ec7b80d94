//! # Memory Cache Provider
//!
//! This module provides an in-memory cache implementation using Moka caching.

use std::future::Future;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use moka::future::Cache as MokaCache;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

use crate::cache::lock::LockTable;
use crate::cache::providers::{CacheReader, CacheWriter, RequestCache};
use crate::cache::types::{CacheConfig, CacheEntry, CacheKey, CacheResult, EntryMetadata};

/// Entry in the memory cache
#[derive(Clone)]
struct StoredEntry {
    /// Cached body bytes
    data: Bytes,
    /// Metadata for the cached content
    entry: CacheEntry,
}

/// Memory cache provider implementation using Moka
#[derive(Clone)]
pub struct MemoryCache {
    cache: MokaCache<CacheKey, StoredEntry>,
    locks: LockTable,
    max_entry_size: u64,
    private: bool,
}

impl MemoryCache {
    /// Create a new memory cache bounded by `max_memory_cache_size` bytes
    pub fn new(config: &CacheConfig) -> Self {
        let cache = MokaCache::builder()
            .weigher(|_k, v: &StoredEntry| v.data.len().try_into().unwrap_or(u32::MAX))
            .max_capacity(config.max_memory_cache_size)
            .build();

        debug!(
            max_size = config.max_memory_cache_size,
            max_entry_size = config.max_entry_size,
            "Memory cache created with size limit"
        );

        Self {
            cache,
            locks: LockTable::new(),
            max_entry_size: config.max_entry_size.min(config.max_memory_cache_size),
            private: config.private,
        }
    }
}

#[async_trait]
impl RequestCache for MemoryCache {
    fn is_private(&self) -> bool {
        self.private
    }

    async fn retrieve(&self, key: &CacheKey) -> CacheResult<Option<(CacheEntry, CacheReader)>> {
        let lock = self.locks.acquire(key);
        let Some(mut stored) = self.cache.get(key).await else {
            return Ok(None);
        };

        stored.entry.hit_count += 1;
        stored.entry.stream_size = stored.data.len() as u64;
        self.cache.insert(key.clone(), stored.clone()).await;

        let reader = CacheReader::new(Cursor::new(stored.data), Some(lock));
        Ok(Some((stored.entry, reader)))
    }

    async fn store(
        &self,
        key: &CacheKey,
        content_length: Option<u64>,
        metadata: EntryMetadata,
    ) -> CacheResult<CacheWriter> {
        self.locks.ensure_unlocked(key)?;

        let mut entry = CacheEntry::new(self.private);
        entry.apply(&metadata);

        Ok(Box::new(MemoryWriter {
            cache: self.cache.clone(),
            key: key.clone(),
            buffer: BytesMut::new(),
            content_length,
            entry: Some(entry),
            max_entry_size: self.max_entry_size,
            discard: false,
            commit: None,
        }))
    }

    async fn update(&self, key: &CacheKey, metadata: EntryMetadata) -> CacheResult<()> {
        let Some(mut stored) = self.cache.get(key).await else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no cache entry for {key}"),
            ));
        };
        stored.entry.apply(&metadata);
        stored.entry.usage_count += 1;
        self.cache.insert(key.clone(), stored).await;
        debug!(key = %key, "Updated memory cache entry metadata");
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.locks.ensure_unlocked(key)?;
        if self.cache.contains_key(key) {
            self.cache.invalidate(key).await;
            debug!(key = %key, "Removed entry from memory cache");
        }
        Ok(())
    }
}

/// Buffers a new entry and inserts it into the moka cache on shutdown
struct MemoryWriter {
    cache: MokaCache<CacheKey, StoredEntry>,
    key: CacheKey,
    buffer: BytesMut,
    content_length: Option<u64>,
    /// Taken when the commit starts
    entry: Option<CacheEntry>,
    max_entry_size: u64,
    discard: bool,
    commit: Option<BoxFuture<'static, ()>>,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.entry.is_none() {
            return Poll::Ready(Err(io::Error::other("cache entry already committed")));
        }
        if self.discard {
            return Poll::Ready(Ok(buf.len()));
        }
        if (self.buffer.len() + buf.len()) as u64 > self.max_entry_size {
            warn!(
                key = %self.key,
                max_entry_size = self.max_entry_size,
                "Entry too large for memory cache, discarding"
            );
            self.discard = true;
            self.buffer.clear();
            return Poll::Ready(Ok(buf.len()));
        }
        self.buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.commit.is_none() {
            let Some(mut entry) = self.entry.take() else {
                return Poll::Ready(Ok(()));
            };
            if self.discard {
                return Poll::Ready(Ok(()));
            }

            let data = self.buffer.split().freeze();
            entry.stream_size = data.len() as u64;
            entry.is_partial = self
                .content_length
                .is_some_and(|length| entry.stream_size < length);

            let cache = self.cache.clone();
            let key = self.key.clone();
            self.commit = Some(Box::pin(async move {
                debug!(key = %key, size = entry.stream_size, partial = entry.is_partial, "Committed memory cache entry");
                cache.insert(key, StoredEntry { data, entry }).await;
            }));
        }

        match self.commit.as_mut() {
            Some(commit) => {
                futures::ready!(commit.as_mut().poll(cx));
                self.commit = None;
                Poll::Ready(Ok(()))
            }
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[inline]
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer() // Write to test output
            .try_init();
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(format!("http://example.com/{name}"))
    }

    fn metadata(headers: &[&str]) -> EntryMetadata {
        EntryMetadata {
            entry_headers: Some(headers.iter().map(|h| h.to_string()).collect()),
            ..Default::default()
        }
    }

    async fn put(cache: &MemoryCache, key: &CacheKey, body: &[u8], length: Option<u64>) {
        let mut writer = cache
            .store(key, length, metadata(&["HTTP/1.1 200 OK"]))
            .await
            .unwrap();
        writer.write_all(body).await.unwrap();
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        init_tracing();
        let cache = MemoryCache::new(&CacheConfig::default());
        let k = key("a");
        put(&cache, &k, b"hello world", Some(11)).await;

        let (entry, mut reader) = cache.retrieve(&k).await.unwrap().unwrap();
        assert_eq!(entry.stream_size, 11);
        assert!(!entry.is_partial);
        assert_eq!(entry.hit_count, 1);
        assert_eq!(entry.entry_headers, vec!["HTTP/1.1 200 OK".to_string()]);

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_short_write_marks_partial() {
        let cache = MemoryCache::new(&CacheConfig::default());
        let k = key("partial");
        put(&cache, &k, b"0123456789", Some(100)).await;

        let (entry, _reader) = cache.retrieve(&k).await.unwrap().unwrap();
        assert!(entry.is_partial);
        assert_eq!(entry.stream_size, 10);
    }

    #[tokio::test]
    async fn test_dropped_writer_discards() {
        let cache = MemoryCache::new(&CacheConfig::default());
        let k = key("dropped");
        let mut writer = cache.store(&k, None, metadata(&[])).await.unwrap();
        writer.write_all(b"abc").await.unwrap();
        drop(writer);
        assert!(cache.retrieve(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_locked_entry_rejects_store_and_remove() {
        let cache = MemoryCache::new(&CacheConfig::default());
        let k = key("locked");
        put(&cache, &k, b"abc", None).await;

        let (_, mut reader) = cache.retrieve(&k).await.unwrap().unwrap();
        let err = cache.store(&k, None, metadata(&[])).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ResourceBusy);
        assert_eq!(
            cache.remove(&k).await.unwrap_err().kind(),
            io::ErrorKind::ResourceBusy
        );

        // metadata updates are allowed while a reader is open
        let mut meta = metadata(&["HTTP/1.1 200 OK", "ETag: \"b\""]);
        meta.last_synchronized_at = Some(chrono::Utc::now());
        cache.update(&k, meta).await.unwrap();

        cache.unlock(&mut reader);
        assert!(!reader.is_locked());
        cache.remove(&k).await.unwrap();
        cache.cache.run_pending_tasks().await;
        assert!(cache.retrieve(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_entry_is_discarded() {
        let config = CacheConfig {
            max_entry_size: 4,
            ..Default::default()
        };
        let cache = MemoryCache::new(&config);
        let k = key("big");
        put(&cache, &k, b"too large", None).await;
        assert!(cache.retrieve(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_entry_is_not_found() {
        let cache = MemoryCache::new(&CacheConfig::default());
        let err = cache.update(&key("none"), metadata(&[])).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
