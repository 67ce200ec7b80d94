//! # File Cache
//!
//! This module implements a file-based persistent cache provider.
//! Each entry is a data file plus a JSON `.meta` file named by the key hash.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::fs;
use tokio::io::{self, AsyncWrite};
use tracing::{debug, warn};

use crate::cache::lock::LockTable;
use crate::cache::providers::{CacheReader, CacheWriter, RequestCache};
use crate::cache::types::{CacheConfig, CacheEntry, CacheKey, CacheResult, EntryMetadata};

#[derive(Debug, Clone)]
pub struct FileCache {
    cache_dir: PathBuf,
    initialized: Arc<AtomicBool>,
    locks: LockTable,
    next_id: Arc<AtomicU64>,
    max_entry_size: u64,
    private: bool,
}

impl FileCache {
    /// Create a new file cache rooted at the configured directory
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cache_dir: config.cache_dir(),
            initialized: Arc::new(AtomicBool::new(false)),
            locks: LockTable::new(),
            next_id: Arc::new(AtomicU64::new(1)),
            max_entry_size: config.max_entry_size,
            private: config.private,
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Initialize the cache directory
    pub(crate) async fn ensure_initialized(&self) -> io::Result<()> {
        // Fast path - already initialized
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        fs::create_dir_all(&self.cache_dir).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Get the path for a cached body
    fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.to_filename())
    }

    /// Get the metadata path for a cached body
    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.data_path(key);
        path.set_extension("meta");
        path
    }

    async fn read_metadata(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);

        if !fs::try_exists(&data_path).await? || !fs::try_exists(&meta_path).await? {
            return Ok(None);
        }

        let metadata_bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to read cache metadata file");
                return Ok(None);
            }
        };

        match serde_json::from_slice::<CacheEntry>(&metadata_bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to parse cache metadata");

                // Delete invalid cache entry as a background task
                tokio::spawn(async move {
                    let _ = fs::remove_file(&data_path).await;
                    let _ = fs::remove_file(&meta_path).await;
                });
                Ok(None)
            }
        }
    }
}

/// Serialize an entry next to its body, via a temporary file
async fn write_metadata(meta_path: &Path, entry: &CacheEntry) -> io::Result<()> {
    let metadata_json = serde_json::to_vec(entry).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize metadata: {e}"),
        )
    })?;

    let temp_meta_path = meta_path.with_extension("meta.tmp");
    fs::write(&temp_meta_path, &metadata_json).await?;
    if let Err(e) = fs::rename(&temp_meta_path, meta_path).await {
        warn!(
            from = ?temp_meta_path,
            to = ?meta_path,
            error = %e,
            "Failed to rename temporary metadata file"
        );
        let _ = fs::remove_file(&temp_meta_path).await;
        return Err(e);
    }
    Ok(())
}

#[async_trait]
impl RequestCache for FileCache {
    fn is_private(&self) -> bool {
        self.private
    }

    async fn retrieve(&self, key: &CacheKey) -> CacheResult<Option<(CacheEntry, CacheReader)>> {
        self.ensure_initialized().await?;

        let lock = self.locks.acquire(key);
        let Some(mut entry) = self.read_metadata(key).await? else {
            return Ok(None);
        };

        let data_path = self.data_path(key);
        let file = match fs::File::open(&data_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = ?data_path, error = %e, "Failed to open cache data file");
                return Err(e);
            }
        };

        entry.stream_size = file.metadata().await?.len();
        entry.hit_count += 1;

        let meta_path = self.meta_path(key);
        if let Err(e) = write_metadata(&meta_path, &entry).await {
            debug!(path = ?meta_path, error = %e, "Failed to persist hit count");
        }

        Ok(Some((entry, CacheReader::new(file, Some(lock)))))
    }

    async fn store(
        &self,
        key: &CacheKey,
        content_length: Option<u64>,
        metadata: EntryMetadata,
    ) -> CacheResult<CacheWriter> {
        self.locks.ensure_unlocked(key)?;
        self.ensure_initialized().await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .cache_dir
            .join(format!("{}.{id}.tmp", key.to_filename()));
        let file = fs::File::create(&temp_path).await?;

        let mut entry = CacheEntry::new(self.private);
        entry.apply(&metadata);

        Ok(Box::new(FileWriter {
            file: Some(file),
            temp_path,
            data_path: self.data_path(key),
            meta_path: self.meta_path(key),
            entry: Some(entry),
            content_length,
            written: 0,
            max_entry_size: self.max_entry_size,
            discard: false,
            commit: None,
            done: false,
        }))
    }

    async fn update(&self, key: &CacheKey, metadata: EntryMetadata) -> CacheResult<()> {
        self.ensure_initialized().await?;

        let Some(mut entry) = self.read_metadata(key).await? else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no cache entry for {key}"),
            ));
        };
        entry.apply(&metadata);
        entry.usage_count += 1;
        write_metadata(&self.meta_path(key), &entry).await?;

        debug!(key = %key, "Updated file cache entry metadata");
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.locks.ensure_unlocked(key)?;
        self.ensure_initialized().await?;

        let data_path = self.data_path(key);
        let meta_path = self.meta_path(key);

        // We don't care if the files don't exist
        let data_result = fs::remove_file(&data_path).await;
        let meta_result = fs::remove_file(&meta_path).await;

        match (data_result, meta_result) {
            (Err(e), _) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?data_path, error = %e, "Failed to remove cache data file");
                Err(e)
            }
            (_, Err(e)) if e.kind() != io::ErrorKind::NotFound => {
                warn!(path = ?meta_path, error = %e, "Failed to remove cache metadata file");
                Err(e)
            }
            _ => {
                debug!(key = %key, "Removed entry from file cache");
                Ok(())
            }
        }
    }
}

/// Writes a new body into a temporary file and moves it into place on shutdown
struct FileWriter {
    file: Option<fs::File>,
    temp_path: PathBuf,
    data_path: PathBuf,
    meta_path: PathBuf,
    /// Taken when the commit starts
    entry: Option<CacheEntry>,
    content_length: Option<u64>,
    written: u64,
    max_entry_size: u64,
    discard: bool,
    commit: Option<BoxFuture<'static, io::Result<()>>>,
    done: bool,
}

impl FileWriter {
    fn start_commit(&mut self, mut entry: CacheEntry) -> BoxFuture<'static, io::Result<()>> {
        let temp_path = self.temp_path.clone();
        let data_path = self.data_path.clone();
        let meta_path = self.meta_path.clone();
        let discard = self.discard;

        entry.stream_size = self.written;
        entry.is_partial = self
            .content_length
            .is_some_and(|length| self.written < length);

        Box::pin(async move {
            if discard {
                let _ = fs::remove_file(&temp_path).await;
                return Ok(());
            }

            if let Err(e) = fs::rename(&temp_path, &data_path).await {
                warn!(
                    from = ?temp_path,
                    to = ?data_path,
                    error = %e,
                    "Failed to rename temporary data file"
                );
                let _ = fs::remove_file(&temp_path).await;
                return Err(e);
            }

            if let Err(e) = write_metadata(&meta_path, &entry).await {
                // Body without metadata is unusable
                let _ = fs::remove_file(&data_path).await;
                return Err(e);
            }

            debug!(
                path = ?data_path,
                size = entry.stream_size,
                partial = entry.is_partial,
                "Committed file cache entry"
            );
            Ok(())
        })
    }
}

impl AsyncWrite for FileWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.discard {
            return Poll::Ready(Ok(buf.len()));
        }
        if self.written + buf.len() as u64 > self.max_entry_size {
            warn!(
                path = ?self.data_path,
                max_entry_size = self.max_entry_size,
                "Entry too large for file cache, discarding"
            );
            self.discard = true;
            return Poll::Ready(Ok(buf.len()));
        }

        let this = &mut *self;
        let Some(file) = this.file.as_mut() else {
            return Poll::Ready(Err(io::Error::other("cache entry already committed")));
        };
        let written = futures::ready!(Pin::new(file).poll_write(cx, buf))?;
        this.written += written as u64;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => Pin::new(file).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(Ok(()));
        }

        if let Some(file) = this.file.as_mut() {
            futures::ready!(Pin::new(file).poll_shutdown(cx))?;
            this.file = None;
        }

        if this.commit.is_none() {
            if let Some(entry) = this.entry.take() {
                this.commit = Some(this.start_commit(entry));
            }
        }

        let result = match this.commit.as_mut() {
            Some(commit) => futures::ready!(commit.as_mut().poll(cx)),
            None => Ok(()),
        };
        this.commit = None;
        this.done = true;
        Poll::Ready(result)
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Never shut down: the temporary body is discarded
        let temp_path = self.temp_path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = fs::remove_file(&temp_path).await;
                });
            }
            Err(_) => {
                let _ = std::fs::remove_file(&temp_path);
            }
        }
    }
}
