use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, warn};

use super::BoxReader;
use crate::cache::{CacheKey, EntryMetadata, RequestCache};

enum State {
    Reading,
    Updating(BoxFuture<'static, io::Result<()>>),
    Done,
}

/// Pass-through reader that writes refreshed entry metadata once the body has
/// been read to the end.
///
/// A reader dropped before the end removes the entry instead, since the
/// metadata it would have written no longer describes a verified body. When
/// the body length is known, a reader dropped after consuming all of it still
/// commits the refresh.
pub struct MetadataUpdateReader {
    inner: BoxReader,
    length: Option<u64>,
    read: u64,
    cache: Arc<dyn RequestCache>,
    key: CacheKey,
    metadata: Option<EntryMetadata>,
    state: State,
    strict: bool,
}

impl MetadataUpdateReader {
    pub fn new(
        inner: BoxReader,
        cache: Arc<dyn RequestCache>,
        key: CacheKey,
        metadata: EntryMetadata,
    ) -> Self {
        Self {
            inner,
            length: None,
            read: 0,
            cache,
            key,
            metadata: Some(metadata),
            state: State::Reading,
            strict: false,
        }
    }

    /// Report a failed update as a read error instead of logging it
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Number of body bytes the consumer is expected to read
    pub fn with_length(mut self, length: Option<u64>) -> Self {
        self.length = length;
        self
    }

    /// Whether the consumer has seen every byte of a body of known length
    fn fully_read(&self) -> bool {
        self.length.is_some_and(|length| self.read >= length)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    fn start_update(&mut self) {
        let Some(metadata) = self.metadata.take() else {
            self.state = State::Done;
            return;
        };
        let cache = self.cache.clone();
        let key = self.key.clone();
        self.state = State::Updating(Box::pin(async move { cache.update(&key, metadata).await }));
    }
}

impl AsyncRead for MetadataUpdateReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match &mut this.state {
                State::Done => return Poll::Ready(Ok(())),
                State::Updating(update) => {
                    let result = ready!(update.as_mut().poll(cx));
                    this.state = State::Done;
                    match result {
                        Ok(()) => debug!(key = %this.key, "Cache entry metadata refreshed"),
                        Err(err) if this.strict => return Poll::Ready(Err(err)),
                        Err(err) => {
                            warn!(key = %this.key, error = %err, "Failed to refresh cache entry metadata")
                        }
                    }
                    return Poll::Ready(Ok(()));
                }
                State::Reading => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let before = buf.filled().len();
                    ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
                    let filled = buf.filled().len() - before;
                    if filled > 0 {
                        this.read += filled as u64;
                        return Poll::Ready(Ok(()));
                    }
                    this.start_update();
                }
            }
        }
    }
}

impl Drop for MetadataUpdateReader {
    fn drop(&mut self) {
        if matches!(self.state, State::Done) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.key, "Body dropped outside a runtime, cache entry left as is");
            return;
        };
        let key = self.key.clone();

        // an update already in flight, or a body consumed to its last byte
        let pending = match std::mem::replace(&mut self.state, State::Done) {
            State::Updating(update) => Some(update),
            State::Reading if self.fully_read() => {
                self.start_update();
                match std::mem::replace(&mut self.state, State::Done) {
                    State::Updating(update) => Some(update),
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(update) = pending {
            debug!(key = %key, "Body fully read, refreshing cache entry metadata");
            handle.spawn(async move {
                if let Err(err) = update.await {
                    warn!(key = %key, error = %err, "Failed to refresh cache entry metadata");
                }
            });
            return;
        }

        let cache = self.cache.clone();
        debug!(key = %key, "Body abandoned before the end, removing cache entry");
        handle.spawn(async move {
            if let Err(err) = cache.remove(&key).await {
                warn!(key = %key, error = %err, "Failed to remove abandoned cache entry");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheEntry, MemoryCache};
    use crate::stream::test_util::chunked;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn stored(cache: &MemoryCache, key: &CacheKey) {
        let mut writer = cache
            .store(key, Some(4), EntryMetadata::default())
            .await
            .unwrap();
        writer.write_all(b"body").await.unwrap();
        writer.shutdown().await.unwrap();
    }

    fn refreshed() -> EntryMetadata {
        let mut entry = CacheEntry::new(true);
        entry.last_synchronized_at = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        EntryMetadata::from_entry(&entry, false)
    }

    #[tokio::test]
    async fn updates_after_full_read() {
        let cache = Arc::new(MemoryCache::new(&CacheConfig::default()));
        let key = CacheKey::new("http://example.com/a");
        stored(&cache, &key).await;

        let body = chunked(b"body", 2).await;
        let mut reader = MetadataUpdateReader::new(Box::new(body), cache.clone(), key.clone(), refreshed());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"body");
        assert!(reader.is_done());

        let (entry, _) = cache.retrieve(&key).await.unwrap().unwrap();
        assert_eq!(entry.last_synchronized_at, refreshed().last_synchronized_at);
        assert_eq!(entry.usage_count, 1);
    }

    #[tokio::test]
    async fn missing_entry_only_fails_when_strict() {
        let cache = Arc::new(MemoryCache::new(&CacheConfig::default()));
        let key = CacheKey::new("http://example.com/gone");

        let body = chunked(b"x", 1).await;
        let mut lenient = MetadataUpdateReader::new(Box::new(body), cache.clone(), key.clone(), refreshed());
        let mut out = Vec::new();
        lenient.read_to_end(&mut out).await.unwrap();

        let body = chunked(b"x", 1).await;
        let mut strict =
            MetadataUpdateReader::new(Box::new(body), cache, key, refreshed()).strict(true);
        let mut out = Vec::new();
        assert!(strict.read_to_end(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn drop_after_reading_known_length_commits() {
        let cache = Arc::new(MemoryCache::new(&CacheConfig::default()));
        let key = CacheKey::new("http://example.com/c");
        stored(&cache, &key).await;

        let body = chunked(b"body", 2).await;
        let mut reader = MetadataUpdateReader::new(Box::new(body), cache.clone(), key.clone(), refreshed())
            .with_length(Some(4));
        let mut out = [0u8; 4];
        reader.read_exact(&mut out).await.unwrap();
        assert!(!reader.is_done());
        drop(reader);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let (entry, _) = cache.retrieve(&key).await.unwrap().unwrap();
        assert_eq!(entry.last_synchronized_at, refreshed().last_synchronized_at);
        assert_eq!(entry.usage_count, 1);
    }

    #[tokio::test]
    async fn early_drop_removes_entry() {
        let cache = Arc::new(MemoryCache::new(&CacheConfig::default()));
        let key = CacheKey::new("http://example.com/b");
        stored(&cache, &key).await;

        let body = chunked(b"body", 1).await;
        let mut reader = MetadataUpdateReader::new(Box::new(body), cache.clone(), key.clone(), refreshed());
        let mut first = [0u8; 1];
        reader.read_exact(&mut first).await.unwrap();
        drop(reader);

        // let the spawned removal run before looking the entry up again
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.retrieve(&key).await.unwrap().is_none());
    }
}
