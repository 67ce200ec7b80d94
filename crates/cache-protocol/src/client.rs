//! # Caching Client
//!
//! Sends requests through the protocol engine: the cache answers when it can,
//! the transport is used otherwise, and live bodies are stored on the way to
//! the caller.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bytes_stream::BytesStreamReader;
use crate::cache::{CacheKey, RequestCache};
use crate::config::ProtocolConfig;
use crate::error::CacheError;
use crate::message::{CacheRequest, CacheResponse};
use crate::protocol::ProtocolEngine;
use crate::stream::{BoxReader, CancelReader};
use crate::validator::{CacheValidator, HttpValidator, Phase, ValidationStatus};

/// Sends a request over the network
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &CacheRequest) -> Result<(CacheResponse, BoxReader), CacheError>;
}

/// Transport backed by a reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client with pooled connections and bounded timeouts
    pub fn with_timeouts(timeout: Duration, connect_timeout: Duration) -> Result<Self, CacheError> {
        let mut builder = Client::builder()
            .pool_max_idle_per_host(5)
            .user_agent(concat!("cache-protocol/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(10));
        if !timeout.is_zero() {
            builder = builder.timeout(timeout);
        }
        if !connect_timeout.is_zero() {
            builder = builder.connect_timeout(connect_timeout);
        }
        Ok(Self::new(builder.build()?))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &CacheRequest) -> Result<(CacheResponse, BoxReader), CacheError> {
        if !matches!(request.uri.scheme(), "http" | "https") {
            return Err(CacheError::InvalidRequest(format!(
                "unsupported scheme {}",
                request.uri.scheme()
            )));
        }
        let response = self
            .client
            .request(request.method.clone(), request.uri.clone())
            .headers(request.headers.clone())
            .send()
            .await?;

        let mut cached = CacheResponse::new(response.status()).with_version(response.version());
        cached.headers = response.headers().clone();
        cached.content_length = response.content_length();
        debug!(
            uri = %request.uri,
            status = %cached.status,
            content_length = ?cached.content_length,
            "Received response"
        );
        Ok((cached, Box::new(BytesStreamReader::from_response(response))))
    }
}

/// Body and head of a response obtained through the cache
pub struct CachedBody {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Served from stored bytes, fully or in part
    pub from_cache: bool,
    /// Final outcome of the protocol engine
    pub outcome: ValidationStatus,
    body: CancelReader,
    cancel: CancellationToken,
}

impl CachedBody {
    /// Stop the body stream; later reads fail with `ConnectionAborted`
    pub fn abort(&self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for CachedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedBody")
            .field("status", &self.status)
            .field("from_cache", &self.from_cache)
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for CachedBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.body).poll_read(cx, buf)
    }
}

/// Client answering requests from a shared cache where the rules allow
pub struct CachingClient<T> {
    transport: T,
    cache: Arc<dyn RequestCache>,
    config: ProtocolConfig,
}

impl<T: HttpTransport> CachingClient<T> {
    pub fn new(transport: T, cache: Arc<dyn RequestCache>, config: ProtocolConfig) -> Self {
        Self {
            transport,
            cache,
            config,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Fetch with the HTTP caching rules
    pub async fn fetch(&self, request: CacheRequest) -> Result<CachedBody, CacheError> {
        self.fetch_with(HttpValidator::new(), request).await
    }

    /// Fetch with the given validator.
    ///
    /// A validator may send a status query in place of the caller's command
    /// and rewrite the request once the reply is known, as the FTP validator
    /// does before resuming a partial entry from its cached size. The
    /// rewritten request is then sent and its body becomes the live body: the
    /// tail appended to the cached bytes, or the whole file.
    pub async fn fetch_with<V: CacheValidator>(
        &self,
        validator: V,
        request: CacheRequest,
    ) -> Result<CachedBody, CacheError> {
        let key = CacheKey::from(&request.uri);
        let mut engine = ProtocolEngine::new(validator, self.cache.clone(), self.config.clone());

        let mut status = engine.get_retrieve_status(key.clone(), request).await?;
        let mut resent = false;
        loop {
            if status == ValidationStatus::ReturnCachedResponse {
                info!(key = %key, "Serving from cache");
                return Self::body_from_cache(&mut engine, status);
            }

            let outgoing = engine
                .outgoing_request()
                .cloned()
                .ok_or_else(|| CacheError::InvalidRequest("no request to send".into()))?;
            debug!(uri = %outgoing.uri, method = %outgoing.method, "Sending request");
            let (response, live) = self.transport.send(&outgoing).await?;

            let revalidated = engine.get_revalidate_status(response.clone()).await?;
            if revalidated == ValidationStatus::RetryResponseFromServer {
                if resent {
                    engine.abort();
                    return Err(CacheError::UnexpectedStatus {
                        phase: Phase::ValidateResponse,
                        status: revalidated,
                    });
                }
                resent = true;
                drop(live);
                let corrected = engine
                    .outgoing_request()
                    .cloned()
                    .ok_or_else(|| CacheError::InvalidRequest("no request to resend".into()))?;
                debug!(key = %key, "Resending corrected request");
                status = engine.get_retrieve_status(key.clone(), corrected).await?;
                continue;
            }

            let (response, live) = match engine.outgoing_request() {
                Some(rewritten)
                    if revalidated != ValidationStatus::ReturnCachedResponse
                        && is_rewritten(&outgoing, rewritten) =>
                {
                    let rewritten = rewritten.clone();
                    drop(live);
                    debug!(
                        key = %key,
                        method = %rewritten.method,
                        offset = rewritten.content_offset,
                        "Sending the command the status query stood in for"
                    );
                    self.transport.send(&rewritten).await?
                }
                _ => (response, live),
            };

            let outcome = engine.get_update_status(Some(live)).await?;
            let from_cache = matches!(
                revalidated,
                ValidationStatus::ReturnCachedResponse
                    | ValidationStatus::CombineCachedAndServerResponse
            );
            let (status_code, headers) = match engine.cached_response() {
                Some(cached) if from_cache => (cached.status, cached.headers),
                _ => (response.status, response.headers),
            };
            info!(key = %key, status = %status_code, outcome = %outcome, from_cache, "Request finished");
            let cancel = engine.cancellation_token();
            let body = take_body(&mut engine);
            return Ok(CachedBody {
                status: status_code,
                headers,
                from_cache,
                outcome,
                body,
                cancel,
            });
        }
    }

    fn body_from_cache<V: CacheValidator>(
        engine: &mut ProtocolEngine<V>,
        outcome: ValidationStatus,
    ) -> Result<CachedBody, CacheError> {
        let cached = engine
            .cached_response()
            .ok_or(CacheError::NoCacheStream(outcome))?;
        let cancel = engine.cancellation_token();
        Ok(CachedBody {
            status: cached.status,
            headers: cached.headers,
            from_cache: true,
            outcome,
            body: take_body(engine),
            cancel,
        })
    }
}

/// Whether a validator replaced the command or restart offset after the reply
fn is_rewritten(sent: &CacheRequest, current: &CacheRequest) -> bool {
    sent.method != current.method || sent.content_offset != current.content_offset
}

fn take_body<V: CacheValidator>(engine: &mut ProtocolEngine<V>) -> CancelReader {
    engine.take_response_stream().unwrap_or_else(|| {
        CancelReader::new(Box::new(tokio::io::empty()), engine.cancellation_token())
    })
}
