//! # Protocol Engine
//!
//! Drives a [`CacheValidator`] through the phases of one logical request and
//! turns its outcomes into storage calls and the body stream handed to the
//! caller.
//!
//! The caller's loop looks like this:
//!
//! 1. [`ProtocolEngine::get_retrieve_status`]; on `ReturnCachedResponse` the
//!    body is ready and nothing is sent.
//! 2. Send [`ProtocolEngine::outgoing_request`] and pass the response to
//!    [`ProtocolEngine::get_revalidate_status`]. On `RetryResponseFromServer`
//!    go back to step 1 with the corrected request.
//! 3. Pass the live body to [`ProtocolEngine::get_update_status`] and read
//!    the stream returned by [`ProtocolEngine::take_response_stream`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheReader, EntryMetadata, RequestCache};
use crate::config::ProtocolConfig;
use crate::error::CacheError;
use crate::message::{CacheRequest, CacheResponse};
use crate::stream::{
    BoxReader, CancelReader, CombinedReader, ForwardingReader, MetadataUpdateReader, RangeStream,
};
use crate::validator::{CacheValidator, FreshnessStatus, Phase, ValidationStatus};

/// Per-request driver of a cache validator over a shared storage backend.
///
/// One engine serves one logical request at a time, including that request's
/// own retries. Use [`ProtocolEngine::reset`] before reusing it.
pub struct ProtocolEngine<V: CacheValidator> {
    validator: V,
    cache: Arc<dyn RequestCache>,
    config: ProtocolConfig,
    status: ValidationStatus,
    retrieved: bool,
    /// Entry stream held between the lookup and the final outcome
    cache_reader: Option<CacheReader>,
    /// Body ready to be handed to the caller
    response_stream: Option<BoxReader>,
    /// Size of the cached window behind `response_stream`
    served_length: Option<u64>,
    cancel: CancellationToken,
}

impl<V: CacheValidator> ProtocolEngine<V> {
    pub fn new(mut validator: V, cache: Arc<dyn RequestCache>, config: ProtocolConfig) -> Self {
        validator
            .context_mut()
            .set_unspecified_max_age(config.unspecified_max_age);
        Self {
            validator,
            cache,
            config,
            status: ValidationStatus::Continue,
            retrieved: false,
            cache_reader: None,
            response_stream: None,
            served_length: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn validator(&self) -> &V {
        &self.validator
    }

    pub fn validator_mut(&mut self) -> &mut V {
        &mut self.validator
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Outcome of the last phase run by the engine
    pub fn status(&self) -> ValidationStatus {
        self.status
    }

    pub fn is_cache_fresh(&self) -> bool {
        self.validator.context().freshness_status() == FreshnessStatus::Fresh
    }

    /// Whether no cache or response stream is held by the engine
    pub fn can_continue(&self) -> bool {
        self.cache_reader.is_none() && self.response_stream.is_none()
    }

    /// Response describing the cached bytes being served
    pub fn cached_response(&self) -> Option<CacheResponse> {
        self.validator.cached_response()
    }

    /// The request to send, including headers the validator added or removed
    pub fn outgoing_request(&self) -> Option<&CacheRequest> {
        self.validator.context().request()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hand out the body stream prepared by the last phase.
    ///
    /// The stream fails with `ConnectionAborted` once [`ProtocolEngine::abort`]
    /// is called.
    pub fn take_response_stream(&mut self) -> Option<CancelReader> {
        self.response_stream
            .take()
            .map(|stream| CancelReader::new(stream, self.cancel.clone()))
    }

    /// Prepare for a new logical request
    pub fn reset(&mut self) {
        self.release_cache_stream();
        self.response_stream = None;
        self.served_length = None;
        self.status = ValidationStatus::Continue;
        self.retrieved = false;
    }

    /// Release every stream held or handed out for the current request.
    /// Calling it again has no further effect.
    pub fn abort(&mut self) {
        if !self.cancel.is_cancelled() {
            debug!("Aborting cache protocol request");
            self.cancel.cancel();
        }
        self.release_cache_stream();
        self.response_stream = None;
        self.cancel = CancellationToken::new();
    }

    /// Run the pre-request phases and the cache lookup.
    ///
    /// Only the first call of a logical request does any work, unless the
    /// previous outcome asked to resend the request.
    pub async fn get_retrieve_status(
        &mut self,
        key: CacheKey,
        request: CacheRequest,
    ) -> Result<ValidationStatus, CacheError> {
        if self.retrieved && self.status != ValidationStatus::RetryResponseFromServer {
            return Ok(self.status);
        }
        self.release_cache_stream();
        self.response_stream = None;
        if self.retrieved {
            self.validator.fetch_retry(request);
        } else {
            self.validator.fetch_request(key, request);
            self.retrieved = true;
        }

        let result = self.retrieve().await;
        self.finish(result)
    }

    /// Run the response checks and the second decision point
    pub async fn get_revalidate_status(
        &mut self,
        response: CacheResponse,
    ) -> Result<ValidationStatus, CacheError> {
        if !self.retrieved {
            return Err(CacheError::InvalidRequest(
                "revalidation requested before retrieval".into(),
            ));
        }
        self.response_stream = None;
        self.validator.set_response(response);
        let result = self.revalidate();
        self.finish(result)
    }

    /// Decide what to persist and build the body stream handed to the caller.
    ///
    /// `live` is the body of the response given to
    /// [`ProtocolEngine::get_revalidate_status`].
    pub async fn get_update_status(
        &mut self,
        live: Option<BoxReader>,
    ) -> Result<ValidationStatus, CacheError> {
        if !self.retrieved {
            return Err(CacheError::InvalidRequest(
                "cache update requested before retrieval".into(),
            ));
        }
        let result = self.update(live).await;
        self.finish(result)
    }

    fn finish(
        &mut self,
        result: Result<ValidationStatus, CacheError>,
    ) -> Result<ValidationStatus, CacheError> {
        match result {
            Ok(status) => {
                self.status = status;
                Ok(status)
            }
            Err(err) => {
                debug!(error = %err, "Cache protocol request failed");
                self.status = ValidationStatus::Fail;
                self.validator.context_mut().validation_status = ValidationStatus::Fail;
                self.release_cache_stream();
                self.response_stream = None;
                Err(err)
            }
        }
    }

    fn record(
        &mut self,
        phase: Phase,
        result: Result<ValidationStatus, CacheError>,
    ) -> Result<ValidationStatus, CacheError> {
        let status = result?;
        debug!(phase = %phase, status = %status, "Validator phase finished");
        if status == ValidationStatus::Fail {
            return Err(CacheError::ValidatorFailed {
                phase,
                reason: "validator reported a failure".into(),
            });
        }
        self.validator.context_mut().validation_status = status;
        Ok(status)
    }

    async fn retrieve(&mut self) -> Result<ValidationStatus, CacheError> {
        let result = self.validator.validate_request();
        let status = self.record(Phase::ValidateRequest, result)?;
        match status {
            ValidationStatus::Continue => {}
            ValidationStatus::DoNotUseCache | ValidationStatus::DoNotTakeFromCache => {
                let is_private = self.cache.is_private();
                self.validator.fetch_cache_entry(None, is_private);
                return Ok(status);
            }
            status => {
                return Err(CacheError::UnexpectedStatus {
                    phase: Phase::ValidateRequest,
                    status,
                });
            }
        }

        let mut lookups = 0;
        loop {
            let key = self
                .validator
                .context()
                .key()
                .cloned()
                .ok_or_else(|| CacheError::InvalidRequest("no cache key".into()))?;
            let found = match self.cache.retrieve(&key).await {
                Ok(found) => found,
                Err(err) if self.config.strict_cache_errors => return Err(err.into()),
                Err(err) => {
                    warn!(key = %key, error = %err, "Cache lookup failed, continuing without the cache");
                    None
                }
            };
            let (entry, reader) = found.unzip();
            debug!(key = %key, hit = entry.is_some(), "Cache lookup finished");
            self.cache_reader = reader;
            let is_private = self.cache.is_private();
            self.validator.fetch_cache_entry(entry, is_private);
            self.validator.validate_freshness();

            let result = self.validator.validate_cache();
            let status = self.record(Phase::ValidateCache, result)?;
            match status {
                ValidationStatus::ReturnCachedResponse => {
                    self.serve_cache(status)?;
                    return Ok(status);
                }
                ValidationStatus::Continue => return Ok(status),
                ValidationStatus::DoNotTakeFromCache | ValidationStatus::DoNotUseCache => {
                    self.release_cache_stream();
                    return Ok(status);
                }
                ValidationStatus::RetryResponseFromCache if lookups < self.config.max_cache_retries => {
                    lookups += 1;
                    self.release_cache_stream();
                }
                status => {
                    return Err(CacheError::UnexpectedStatus {
                        phase: Phase::ValidateCache,
                        status,
                    });
                }
            }
        }
    }

    fn revalidate(&mut self) -> Result<ValidationStatus, CacheError> {
        let result = self.validator.validate_response();
        let status = self.record(Phase::ValidateResponse, result)?;
        match status {
            ValidationStatus::Continue => {}
            ValidationStatus::RetryResponseFromServer => {
                self.release_cache_stream();
                return Ok(status);
            }
            status => {
                return Err(CacheError::UnexpectedStatus {
                    phase: Phase::ValidateResponse,
                    status,
                });
            }
        }

        let result = self.validator.revalidate_cache();
        let status = self.record(Phase::RevalidateCache, result)?;
        match status {
            ValidationStatus::ReturnCachedResponse => self.serve_cache(status)?,
            ValidationStatus::CombineCachedAndServerResponse => {
                // held until the live body arrives
                let reader = self
                    .cache_reader
                    .as_mut()
                    .ok_or(CacheError::NoCacheStream(status))?;
                self.cache.unlock(reader);
            }
            ValidationStatus::DoNotTakeFromCache
            | ValidationStatus::DoNotUseCache
            | ValidationStatus::RemoveFromCache
            | ValidationStatus::RetryResponseFromServer
            | ValidationStatus::Continue => self.release_cache_stream(),
            status => {
                return Err(CacheError::UnexpectedStatus {
                    phase: Phase::RevalidateCache,
                    status,
                });
            }
        }
        Ok(status)
    }

    async fn update(&mut self, live: Option<BoxReader>) -> Result<ValidationStatus, CacheError> {
        let previous = self.status;
        // the update rewrites the entry size to the full length
        let head_len = self.validator.context().entry().map(|entry| entry.stream_size);
        let result = self.validator.update_cache();
        let mut status = self.record(Phase::UpdateCache, result)?;
        if previous == ValidationStatus::ReturnCachedResponse
            && status == ValidationStatus::CacheResponse
        {
            // the body is the stored entry itself
            warn!("Refusing to store a response served from cache, leaving the entry as is");
            status = ValidationStatus::DoNotUpdateCache;
            self.validator.context_mut().validation_status = status;
        }

        let (key, offset, length, metadata) = {
            let ctx = self.validator.context();
            let key = ctx
                .key()
                .cloned()
                .ok_or_else(|| CacheError::InvalidRequest("no cache key".into()))?;
            let include_headers =
                status == ValidationStatus::CacheResponse || !ctx.keep_stored_headers();
            let metadata = ctx
                .entry()
                .map(|entry| EntryMetadata::from_entry(entry, include_headers))
                .unwrap_or_default();
            (key, ctx.cache_stream_offset(), ctx.store_content_length(), metadata)
        };

        let (body, skip) = match previous {
            ValidationStatus::CombineCachedAndServerResponse => {
                let head = self
                    .cache_reader
                    .take()
                    .ok_or(CacheError::NoCacheStream(previous))?;
                let tail = live.ok_or_else(|| {
                    CacheError::InvalidRequest("combining requires the live body".into())
                })?;
                // the live tail carries whatever the stored length lacks
                let tail_len = head_len.zip(length).map(|(cached, total)| total.saturating_sub(cached));
                let combined = CombinedReader::new(Box::new(head), tail).with_lengths(head_len, tail_len);
                debug!(total = ?combined.len(), offset, "Combining cached head with live tail");
                let combined: BoxReader = Box::new(combined);
                (Some(combined), offset)
            }
            ValidationStatus::ReturnCachedResponse => (self.response_stream.take(), 0),
            _ => (live, 0),
        };
        let strict = self.config.strict_cache_errors;

        let served = match status {
            ValidationStatus::CacheResponse => {
                let body = body.ok_or_else(|| {
                    CacheError::InvalidRequest("storing requires the live body".into())
                })?;
                match self.cache.store(&key, length, metadata).await {
                    Ok(writer) => {
                        debug!(key = %key, content_length = ?length, "Storing live response");
                        let tee: BoxReader = Box::new(
                            ForwardingReader::new(body, writer)
                                .with_skip(skip)
                                .propagate_errors(strict),
                        );
                        Some(tee)
                    }
                    Err(err) if strict => return Err(err.into()),
                    Err(err) => {
                        warn!(key = %key, error = %err, "Cannot open cache entry, serving without caching");
                        Some(skipped(body, skip))
                    }
                }
            }
            ValidationStatus::UpdateResponseInformation => {
                let body = body.ok_or(CacheError::NoCacheStream(status))?;
                let served_length = match previous {
                    ValidationStatus::ReturnCachedResponse => self.served_length,
                    _ => None,
                };
                let reader: BoxReader = Box::new(
                    MetadataUpdateReader::new(skipped(body, skip), self.cache.clone(), key, metadata)
                        .with_length(served_length)
                        .strict(strict),
                );
                Some(reader)
            }
            ValidationStatus::RemoveFromCache => {
                match self.cache.remove(&key).await {
                    Ok(()) => debug!(key = %key, "Removed cache entry"),
                    Err(err) if strict => return Err(err.into()),
                    Err(err) => warn!(key = %key, error = %err, "Failed to remove cache entry"),
                }
                body.map(|body| skipped(body, skip))
            }
            ValidationStatus::DoNotUpdateCache => body.map(|body| skipped(body, skip)),
            status => {
                return Err(CacheError::UnexpectedStatus {
                    phase: Phase::UpdateCache,
                    status,
                });
            }
        };
        self.response_stream = served;
        Ok(status)
    }

    /// Serve the held entry stream, windowed to the validator's range
    fn serve_cache(&mut self, status: ValidationStatus) -> Result<(), CacheError> {
        let mut reader = self
            .cache_reader
            .take()
            .ok_or(CacheError::NoCacheStream(status))?;
        self.cache.unlock(&mut reader);

        let ctx = self.validator.context();
        let offset = ctx.cache_stream_offset();
        let length = ctx.cache_stream_length();
        let size = ctx.entry().map_or(0, |entry| entry.stream_size);
        let whole = offset == 0 && length.is_none_or(|length| length >= size);
        debug!(offset, length = ?length, size, "Serving cached response");
        let remaining = size.saturating_sub(offset);
        self.served_length = Some(length.map_or(remaining, |length| length.min(remaining)));

        let stream: BoxReader = if whole {
            Box::new(reader)
        } else {
            Box::new(RangeStream::new(reader, offset, length))
        };
        self.response_stream = Some(stream);
        Ok(())
    }

    fn release_cache_stream(&mut self) {
        if self.cache_reader.take().is_some() {
            debug!("Released cache stream");
        }
        self.validator.context_mut().release_stream();
    }
}

fn skipped(body: BoxReader, skip: u64) -> BoxReader {
    if skip == 0 {
        body
    } else {
        Box::new(ForwardingReader::skipping(body, skip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheEntry, CacheResult, CacheWriter, MemoryCache};
    use crate::policy::{CacheLevel, CachePolicy};
    use crate::validator::{HttpValidator, ValidatorContext, headers::format_http_date};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use reqwest::StatusCode;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init();
    }

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ago(secs: i64) -> String {
        format_http_date(now() - TimeDelta::seconds(secs))
    }

    fn get(url: &str) -> (CacheKey, CacheRequest) {
        let request = CacheRequest::get(url::Url::parse(url).unwrap());
        (CacheKey::from(&request.uri), request)
    }

    fn engine(cache: Arc<dyn RequestCache>) -> ProtocolEngine<HttpValidator> {
        init_tracing();
        let mut engine = ProtocolEngine::new(HttpValidator::new(), cache, ProtocolConfig::default());
        engine.validator_mut().context_mut().set_now(now());
        engine
    }

    fn memory_cache() -> Arc<MemoryCache> {
        Arc::new(MemoryCache::new(&CacheConfig::default()))
    }

    async fn put(cache: &MemoryCache, key: &CacheKey, lines: &[String], body: &[u8], length: u64) {
        let metadata = EntryMetadata {
            entry_headers: Some(lines.to_vec()),
            last_synchronized_at: Some(now() - TimeDelta::hours(2)),
            ..Default::default()
        };
        let mut writer = cache.store(key, Some(length), metadata).await.unwrap();
        writer.write_all(body).await.unwrap();
        writer.shutdown().await.unwrap();
    }

    async fn read_all(engine: &mut ProtocolEngine<impl CacheValidator>) -> Vec<u8> {
        let mut stream = engine.take_response_stream().expect("body stream");
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    fn body(data: &'static [u8]) -> Option<BoxReader> {
        Some(Box::new(data))
    }

    #[tokio::test]
    async fn miss_is_stored_then_served_fresh() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/a");

        let mut first = engine(cache.clone());
        let status = first.get_retrieve_status(key.clone(), request.clone()).await.unwrap();
        assert_eq!(status, ValidationStatus::DoNotTakeFromCache);

        let response = CacheResponse::new(StatusCode::OK)
            .with_header("Date", ago(0))
            .with_header("Cache-Control", "max-age=3600")
            .with_content_length(5);
        assert_eq!(
            first.get_revalidate_status(response).await.unwrap(),
            ValidationStatus::DoNotTakeFromCache
        );
        assert_eq!(
            first.get_update_status(body(b"hello")).await.unwrap(),
            ValidationStatus::CacheResponse
        );
        assert_eq!(read_all(&mut first).await, b"hello");

        let mut second = engine(cache.clone());
        let status = second.get_retrieve_status(key, request).await.unwrap();
        assert_eq!(status, ValidationStatus::ReturnCachedResponse);
        assert!(second.is_cache_fresh());
        assert_eq!(second.cached_response().unwrap().status, StatusCode::OK);
        assert_eq!(read_all(&mut second).await, b"hello");
        assert!(second.can_continue());
    }

    #[tokio::test]
    async fn retrieve_runs_once_per_request() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/a");
        let mut engine = engine(cache);
        let first = engine.get_retrieve_status(key.clone(), request.clone()).await.unwrap();
        let again = engine.get_retrieve_status(key, request).await.unwrap();
        assert_eq!(first, again);
    }

    fn stale_lines() -> Vec<String> {
        vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(7200)),
            "Cache-Control: max-age=60".to_string(),
            "ETag: \"v1\"".to_string(),
            "Content-Length: 5".to_string(),
        ]
    }

    #[tokio::test]
    async fn not_modified_serves_cache_and_refreshes_metadata() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/a");
        put(&cache, &key, &stale_lines(), b"hello", 5).await;

        let mut engine = engine(cache.clone());
        let status = engine.get_retrieve_status(key.clone(), request).await.unwrap();
        assert_eq!(status, ValidationStatus::Continue);
        assert!(!engine.is_cache_fresh());
        let outgoing = engine.outgoing_request().unwrap();
        assert_eq!(outgoing.headers.get("if-none-match").unwrap(), "\"v1\"");
        assert!(!engine.can_continue());

        let response = CacheResponse::new(StatusCode::NOT_MODIFIED)
            .with_header("Date", ago(5))
            .with_header("ETag", "\"v1\"");
        assert_eq!(
            engine.get_revalidate_status(response).await.unwrap(),
            ValidationStatus::ReturnCachedResponse
        );
        assert_eq!(
            engine.get_update_status(None).await.unwrap(),
            ValidationStatus::UpdateResponseInformation
        );
        assert_eq!(read_all(&mut engine).await, b"hello");

        let (entry, _) = cache.retrieve(&key).await.unwrap().unwrap();
        assert_eq!(entry.usage_count, 1);
        assert_eq!(entry.last_synchronized_at, Some(now()));
        // a bare 304 leaves the stored header block alone
        assert_eq!(entry.entry_headers, stale_lines());
    }

    #[tokio::test]
    async fn not_modified_body_dropped_after_last_byte_keeps_entry() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/a");
        put(&cache, &key, &stale_lines(), b"hello", 5).await;

        let mut engine = engine(cache.clone());
        engine.get_retrieve_status(key.clone(), request).await.unwrap();
        let response = CacheResponse::new(StatusCode::NOT_MODIFIED)
            .with_header("Date", ago(5))
            .with_header("ETag", "\"v1\"");
        engine.get_revalidate_status(response).await.unwrap();
        assert_eq!(
            engine.get_update_status(None).await.unwrap(),
            ValidationStatus::UpdateResponseInformation
        );

        // the consumer stops once it has the advertised length
        let mut stream = engine.take_response_stream().expect("body stream");
        let mut out = [0u8; 5];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
        drop(stream);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let (entry, _) = cache.retrieve(&key).await.unwrap().expect("entry kept");
        assert_eq!(entry.last_synchronized_at, Some(now()));
        assert_eq!(entry.usage_count, 1);
    }

    #[tokio::test]
    async fn partial_entry_is_completed_by_combining() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/big");
        let lines = vec![
            "HTTP/1.1 206 Partial Content".to_string(),
            format!("Date: {}", ago(10)),
            "Cache-Control: max-age=3600".to_string(),
            "ETag: \"v1\"".to_string(),
            "Content-Range: bytes 0-3/10".to_string(),
            "Content-Length: 4".to_string(),
        ];
        put(&cache, &key, &lines, b"0123", 10).await;

        let mut engine = engine(cache.clone());
        let status = engine.get_retrieve_status(key.clone(), request.clone()).await.unwrap();
        assert_eq!(status, ValidationStatus::Continue);
        assert_eq!(engine.outgoing_request().unwrap().headers.get("range").unwrap(), "bytes=4-");

        let response = CacheResponse::new(StatusCode::PARTIAL_CONTENT)
            .with_header("Date", ago(0))
            .with_header("ETag", "\"v1\"")
            .with_header("Content-Range", "bytes 4-9/10")
            .with_content_length(6);
        assert_eq!(
            engine.get_revalidate_status(response).await.unwrap(),
            ValidationStatus::CombineCachedAndServerResponse
        );
        assert_eq!(
            engine.get_update_status(body(b"456789")).await.unwrap(),
            ValidationStatus::CacheResponse
        );
        assert_eq!(engine.cached_response().unwrap().status, StatusCode::OK);
        assert_eq!(read_all(&mut engine).await, b"0123456789");

        engine.reset();
        let status = engine.get_retrieve_status(key, request).await.unwrap();
        assert_eq!(status, ValidationStatus::ReturnCachedResponse);
        assert_eq!(read_all(&mut engine).await, b"0123456789");
    }

    #[tokio::test]
    async fn masked_server_error_keeps_stored_entry() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/a");
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(10)),
            "Cache-Control: max-age=3600".to_string(),
            "ETag: \"v1\"".to_string(),
            "Content-Length: 5".to_string(),
        ];
        put(&cache, &key, &lines, b"hello", 5).await;

        let mut engine = engine(cache.clone());
        let request = request.with_policy(CachePolicy::new(CacheLevel::Revalidate));
        let status = engine.get_retrieve_status(key.clone(), request).await.unwrap();
        assert_eq!(status, ValidationStatus::Continue);

        let response = CacheResponse::new(StatusCode::SERVICE_UNAVAILABLE)
            .with_header("Date", ago(0))
            .with_header("Cache-Control", "max-age=60")
            .with_content_length(11);
        assert_eq!(
            engine.get_revalidate_status(response).await.unwrap(),
            ValidationStatus::ReturnCachedResponse
        );
        let served = engine.cached_response().unwrap();
        assert_eq!(served.status, StatusCode::OK);
        assert!(
            served
                .headers
                .get("warning")
                .is_some_and(|w| w.to_str().unwrap().starts_with("111"))
        );
        assert_eq!(
            engine.get_update_status(body(b"unavailable")).await.unwrap(),
            ValidationStatus::DoNotUpdateCache
        );
        assert_eq!(read_all(&mut engine).await, b"hello");

        let (entry, mut reader) = cache.retrieve(&key).await.unwrap().unwrap();
        assert_eq!(entry.entry_headers, lines);
        let mut stored = Vec::new();
        reader.read_to_end(&mut stored).await.unwrap();
        assert_eq!(stored, b"hello");
    }

    #[tokio::test]
    async fn unbounded_content_range_end_passes_through() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/big");
        let lines = vec![
            "HTTP/1.1 206 Partial Content".to_string(),
            format!("Date: {}", ago(10)),
            "Cache-Control: max-age=3600".to_string(),
            "ETag: \"v1\"".to_string(),
            "Content-Range: bytes 0-3/10".to_string(),
            "Content-Length: 4".to_string(),
        ];
        put(&cache, &key, &lines, b"0123", 10).await;

        let mut engine = engine(cache.clone());
        let status = engine.get_retrieve_status(key.clone(), request).await.unwrap();
        assert_eq!(status, ValidationStatus::Continue);

        let response = CacheResponse::new(StatusCode::PARTIAL_CONTENT)
            .with_header("Date", ago(0))
            .with_header("ETag", "\"v1\"")
            .with_header("Content-Range", format!("bytes 4-{}/*", u64::MAX))
            .with_content_length(6);
        assert_eq!(
            engine.get_revalidate_status(response).await.unwrap(),
            ValidationStatus::DoNotTakeFromCache
        );
        assert_eq!(
            engine.get_update_status(body(b"456789")).await.unwrap(),
            ValidationStatus::DoNotUpdateCache
        );
        assert_eq!(read_all(&mut engine).await, b"456789");

        let (entry, _) = cache.retrieve(&key).await.unwrap().unwrap();
        assert_eq!(entry.stream_size, 4);
        assert!(entry.is_partial);
        assert_eq!(entry.entry_headers, lines);
    }

    #[tokio::test]
    async fn retry_resends_unconditionally_and_stores() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/a");
        put(&cache, &key, &stale_lines(), b"hello", 5).await;

        let mut engine = engine(cache.clone());
        engine.get_retrieve_status(key.clone(), request.clone()).await.unwrap();

        // older than what the cache already holds
        let response = CacheResponse::new(StatusCode::OK)
            .with_header("Date", ago(9000))
            .with_content_length(5);
        assert_eq!(
            engine.get_revalidate_status(response).await.unwrap(),
            ValidationStatus::RetryResponseFromServer
        );
        let corrected = engine.outgoing_request().cloned().unwrap();
        assert!(corrected.headers.get("if-none-match").is_none());
        assert_eq!(corrected.headers.get("cache-control").unwrap(), "max-age=0");

        let status = engine.get_retrieve_status(key.clone(), corrected).await.unwrap();
        assert_eq!(status, ValidationStatus::DoNotTakeFromCache);
        assert_eq!(engine.validator().context().response_count(), 1);

        let response = CacheResponse::new(StatusCode::OK)
            .with_header("Date", ago(0))
            .with_header("Cache-Control", "max-age=3600")
            .with_header("ETag", "\"v2\"")
            .with_content_length(5);
        assert_eq!(
            engine.get_revalidate_status(response).await.unwrap(),
            ValidationStatus::DoNotTakeFromCache
        );
        assert_eq!(
            engine.get_update_status(body(b"world")).await.unwrap(),
            ValidationStatus::CacheResponse
        );
        assert_eq!(read_all(&mut engine).await, b"world");

        let (entry, _) = cache.retrieve(&key).await.unwrap().unwrap();
        assert!(
            entry
                .entry_headers
                .iter()
                .any(|line| line.eq_ignore_ascii_case("etag: \"v2\""))
        );
    }

    #[tokio::test]
    async fn cache_only_miss_fails() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/missing");
        let request = request.with_policy(CachePolicy::new(CacheLevel::CacheOnly));

        let mut engine = engine(cache);
        let err = engine.get_retrieve_status(key, request).await.unwrap_err();
        assert!(matches!(err, CacheError::EntryNotFound));
        assert_eq!(engine.status(), ValidationStatus::Fail);
        assert!(engine.can_continue());
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_stops_handed_out_streams() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/a");
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(10)),
            "Cache-Control: max-age=3600".to_string(),
        ];
        put(&cache, &key, &lines, b"hello", 5).await;

        let mut engine = engine(cache);
        let status = engine.get_retrieve_status(key, request).await.unwrap();
        assert_eq!(status, ValidationStatus::ReturnCachedResponse);
        let mut stream = engine.take_response_stream().unwrap();

        engine.abort();
        engine.abort();
        assert!(engine.can_continue());

        let mut out = Vec::new();
        let err = stream.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn user_range_is_served_from_cached_bytes() {
        let cache = memory_cache();
        let (key, request) = get("http://example.com/a");
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(10)),
            "Cache-Control: max-age=3600".to_string(),
            "Content-Length: 10".to_string(),
        ];
        put(&cache, &key, &lines, b"0123456789", 10).await;

        let mut engine = engine(cache);
        let request = request.with_header("Range", "bytes=2-5");
        let status = engine.get_retrieve_status(key, request).await.unwrap();
        assert_eq!(status, ValidationStatus::ReturnCachedResponse);
        assert_eq!(
            engine.cached_response().unwrap().status,
            StatusCode::PARTIAL_CONTENT
        );
        assert_eq!(read_all(&mut engine).await, b"2345");
    }

    /// Backend whose every operation fails
    struct BrokenCache;

    #[async_trait]
    impl RequestCache for BrokenCache {
        fn is_private(&self) -> bool {
            true
        }

        async fn retrieve(&self, _key: &CacheKey) -> CacheResult<Option<(CacheEntry, CacheReader)>> {
            Err(io::Error::other("disk gone"))
        }

        async fn store(
            &self,
            _key: &CacheKey,
            _content_length: Option<u64>,
            _metadata: EntryMetadata,
        ) -> CacheResult<CacheWriter> {
            Err(io::Error::other("disk gone"))
        }

        async fn update(&self, _key: &CacheKey, _metadata: EntryMetadata) -> CacheResult<()> {
            Err(io::Error::other("disk gone"))
        }

        async fn remove(&self, _key: &CacheKey) -> CacheResult<()> {
            Err(io::Error::other("disk gone"))
        }
    }

    #[tokio::test]
    async fn storage_failures_degrade_unless_strict() {
        let (key, request) = get("http://example.com/a");
        let response = || {
            CacheResponse::new(StatusCode::OK)
                .with_header("Date", ago(0))
                .with_header("Cache-Control", "max-age=3600")
                .with_content_length(2)
        };

        let mut lenient = engine(Arc::new(BrokenCache));
        lenient.get_retrieve_status(key.clone(), request.clone()).await.unwrap();
        lenient.get_revalidate_status(response()).await.unwrap();
        assert_eq!(
            lenient.get_update_status(body(b"ok")).await.unwrap(),
            ValidationStatus::CacheResponse
        );
        assert_eq!(read_all(&mut lenient).await, b"ok");

        let config = ProtocolConfig::builder().with_strict_cache_errors(true).build();
        let mut strict = ProtocolEngine::new(HttpValidator::new(), Arc::new(BrokenCache), config);
        let err = strict.get_retrieve_status(key, request).await.unwrap_err();
        assert!(matches!(err, CacheError::Storage(_)));
    }

    /// Validator answering the request phase and every later phase with
    /// fixed statuses
    #[derive(Default)]
    struct FixedValidator {
        ctx: ValidatorContext,
        request: ValidationStatus,
        answer: ValidationStatus,
        lookups: u32,
    }

    impl CacheValidator for FixedValidator {
        fn context(&self) -> &ValidatorContext {
            &self.ctx
        }

        fn context_mut(&mut self) -> &mut ValidatorContext {
            &mut self.ctx
        }

        fn validate_request(&mut self) -> Result<ValidationStatus, CacheError> {
            Ok(self.request)
        }

        fn validate_freshness(&mut self) -> FreshnessStatus {
            FreshnessStatus::Undefined
        }

        fn validate_cache(&mut self) -> Result<ValidationStatus, CacheError> {
            self.lookups += 1;
            Ok(self.answer)
        }

        fn validate_response(&mut self) -> Result<ValidationStatus, CacheError> {
            Ok(self.answer)
        }

        fn revalidate_cache(&mut self) -> Result<ValidationStatus, CacheError> {
            Ok(self.answer)
        }

        fn update_cache(&mut self) -> Result<ValidationStatus, CacheError> {
            Ok(self.answer)
        }

        fn cached_response(&self) -> Option<CacheResponse> {
            None
        }
    }

    #[tokio::test]
    async fn out_of_phase_outcomes_name_the_phase() {
        let (key, request) = get("http://example.com/a");
        let validator = FixedValidator {
            request: ValidationStatus::ReturnCachedResponse,
            ..Default::default()
        };
        let mut engine = ProtocolEngine::new(validator, memory_cache(), ProtocolConfig::default());
        let err = engine.get_retrieve_status(key.clone(), request.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::UnexpectedStatus {
                phase: Phase::ValidateRequest,
                status: ValidationStatus::ReturnCachedResponse
            }
        ));

        let validator = FixedValidator {
            request: ValidationStatus::Fail,
            ..Default::default()
        };
        let mut engine = ProtocolEngine::new(validator, memory_cache(), ProtocolConfig::default());
        let err = engine.get_retrieve_status(key, request).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::ValidatorFailed {
                phase: Phase::ValidateRequest,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cache_lookup_retries_are_bounded() {
        let (key, request) = get("http://example.com/a");
        let validator = FixedValidator {
            answer: ValidationStatus::RetryResponseFromCache,
            ..Default::default()
        };
        let config = ProtocolConfig::builder().with_max_cache_retries(2).build();
        let mut engine = ProtocolEngine::new(validator, memory_cache(), config);

        let err = engine.get_retrieve_status(key, request).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::UnexpectedStatus {
                phase: Phase::ValidateCache,
                status: ValidationStatus::RetryResponseFromCache
            }
        ));
        assert_eq!(engine.validator().lookups, 3);
    }
}
