//! FTP validator.
//!
//! FTP has no conditional retrieval. An entry is revalidated by rewriting the
//! command into a file status query (`MDTM`); the 213 reply carries the
//! file's `Last-Modified` and, when the server reports it, its size as the
//! declared content length. The same reply describes the transfer that
//! follows. Through an HTTP proxy the request travels as an HTTP GET and the
//! composed [`HttpValidator`] applies the HTTP rules.

use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, HeaderMap, LAST_MODIFIED};
use reqwest::{Method, StatusCode, Version};
use tracing::debug;

use super::context::ValidatorContext;
use super::headers::{format_http_date, header_date, header_str, parse_seconds, set_header};
use super::http::HttpValidator;
use super::rfc2616::{UNKNOWN_AGE, validate_by_client_policy};
use super::{CacheValidator, FreshnessStatus, ValidationStatus};
use crate::error::CacheError;
use crate::message::CacheResponse;
use crate::policy::CacheLevel;

const FILE_STATUS: u16 = 213;
const TRANSFER_COMPLETE: u16 = 226;
const FILE_UNAVAILABLE: u16 = 550;
/// Replies that open, or close, a data transfer
const DATA_REPLIES: [u16; 4] = [125, 150, 226, 250];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FtpCommand {
    #[default]
    Other,
    /// RETR
    Retrieve,
    /// Commands changing the file at the URI
    Mutate,
}

impl FtpCommand {
    fn classify(method: &Method) -> Self {
        match method.as_str().to_ascii_uppercase().as_str() {
            "RETR" => Self::Retrieve,
            "STOR" | "STOU" | "APPE" | "DELE" | "RNFR" | "RNTO" => Self::Mutate,
            _ => Self::Other,
        }
    }
}

/// Validator for `ftp://` requests.
///
/// Revalidation sends a status query in place of `RETR`. Once the reply is
/// known the request is rewritten back to the original command: resuming from
/// the cached size when a partial entry is combined, or from the caller's
/// restart offset otherwise. The rewritten request still has to be sent, and
/// its body passed to the update phase, as `CachingClient::fetch_with` does.
#[derive(Debug)]
pub struct FtpValidator {
    /// Owns the shared context; runs the HTTP rules when proxied
    http: HttpValidator,
    command: FtpCommand,
    /// Command replaced by the status query
    original_method: Option<Method>,
    /// Restart offset the caller asked for
    user_offset: u64,
    status_query: bool,
}

impl Default for FtpValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl FtpValidator {
    pub fn new() -> Self {
        Self {
            http: HttpValidator::for_ftp_proxy(),
            command: FtpCommand::Other,
            original_method: None,
            user_offset: 0,
            status_query: false,
        }
    }

    fn ctx(&self) -> &ValidatorContext {
        &self.http.ctx
    }

    fn proxied(&self) -> bool {
        self.ctx()
            .request()
            .is_some_and(|request| request.through_http_proxy)
    }

    /// Refresh behaves like Reload, CacheOrNextCacheOnly like CacheOnly
    fn level(&self) -> CacheLevel {
        match self.http.level() {
            CacheLevel::Refresh => CacheLevel::Reload,
            CacheLevel::CacheOrNextCacheOnly => CacheLevel::CacheOnly,
            level => level,
        }
    }

    fn prohibited_or(&self, status: ValidationStatus) -> Result<ValidationStatus, CacheError> {
        if self.level() == CacheLevel::CacheOnly {
            return Err(CacheError::ProhibitedByPolicy);
        }
        Ok(status)
    }

    fn not_in_cache(&self) -> Result<ValidationStatus, CacheError> {
        if self.level() == CacheLevel::CacheOnly {
            return Err(CacheError::EntryNotFound);
        }
        Ok(ValidationStatus::DoNotTakeFromCache)
    }

    /// Heuristic freshness from the entry's own timestamps.
    ///
    /// The lifetime is the explicit expiry when one was stored, otherwise 10%
    /// of the file's age when it was last synchronized.
    fn compute_freshness(&mut self) -> FreshnessStatus {
        let now = self.ctx().now();
        let unspecified = self.ctx().unspecified_max_age();
        let Some((synced, expires, last_modified)) = self.ctx().entry().map(|entry| {
            (
                entry.last_synchronized_at,
                entry.expires_at,
                entry.last_modified_at,
            )
        }) else {
            return FreshnessStatus::Undefined;
        };
        let Some(synced) = synced else {
            self.http.cache_age = UNKNOWN_AGE;
            return FreshnessStatus::Stale;
        };

        let age = (now - synced).num_seconds().max(0);
        let max_age = match (expires, last_modified) {
            (Some(expires), _) => (expires - synced).num_seconds(),
            (None, Some(last_modified)) => {
                self.http.heuristic = true;
                (synced - last_modified).num_seconds().max(0) / 10
            }
            (None, None) => i64::try_from(unspecified.as_secs()).unwrap_or(i64::MAX),
        };

        self.http.cache_age = age;
        self.http.cache_max_age = max_age;
        if age < max_age {
            FreshnessStatus::Fresh
        } else {
            FreshnessStatus::Stale
        }
    }

    fn start_status_query(&mut self) -> Result<(), CacheError> {
        let query = Method::from_bytes(b"MDTM")
            .map_err(|err| CacheError::InvalidRequest(err.to_string()))?;
        if let Some(request) = self.http.ctx.request_mut() {
            self.original_method = Some(std::mem::replace(&mut request.method, query));
        }
        self.status_query = true;
        Ok(())
    }

    /// Put the caller's command back, restarting the transfer at `offset`
    fn restore_command(&mut self, offset: u64) {
        let original = self.original_method.take();
        if let Some(request) = self.http.ctx.request_mut() {
            if let Some(method) = original {
                request.method = method;
            }
            request.content_offset = offset;
        }
        self.status_query = false;
    }

    fn live_file_info(&self) -> Option<(u16, Option<DateTime<Utc>>, Option<u64>)> {
        let response = self.ctx().response()?;
        let size = response.content_length.or_else(|| {
            header_str(&response.headers, CONTENT_LENGTH).and_then(parse_seconds)
        });
        Some((
            response.status.as_u16(),
            header_date(&response.headers, LAST_MODIFIED),
            size,
        ))
    }
}

impl CacheValidator for FtpValidator {
    fn context(&self) -> &ValidatorContext {
        &self.http.ctx
    }

    fn context_mut(&mut self) -> &mut ValidatorContext {
        &mut self.http.ctx
    }

    fn validate_request(&mut self) -> Result<ValidationStatus, CacheError> {
        let Some((command, binary, offset)) = self.ctx().request().map(|request| {
            (
                FtpCommand::classify(&request.method),
                request.binary,
                request.content_offset,
            )
        }) else {
            return Err(CacheError::InvalidRequest("no request to validate".into()));
        };
        self.command = command;
        self.user_offset = offset;

        if self.proxied() {
            if command != FtpCommand::Retrieve {
                return self.prohibited_or(ValidationStatus::DoNotUseCache);
            }
            // the proxy is asked for the file with a plain GET
            if let Some(request) = self.http.ctx.request_mut() {
                request.method = Method::GET;
            }
            return self.http.validate_request();
        }

        if self.level() == CacheLevel::BypassCache {
            return Ok(ValidationStatus::DoNotUseCache);
        }
        match command {
            FtpCommand::Mutate => return self.prohibited_or(ValidationStatus::DoNotTakeFromCache),
            FtpCommand::Other => return self.prohibited_or(ValidationStatus::DoNotUseCache),
            FtpCommand::Retrieve => {}
        }
        if !binary {
            debug!("ASCII transfers are not cached");
            return self.prohibited_or(ValidationStatus::DoNotUseCache);
        }
        if matches!(
            self.level(),
            CacheLevel::Reload | CacheLevel::NoCacheNoStore
        ) {
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }
        Ok(ValidationStatus::Continue)
    }

    fn validate_freshness(&mut self) -> FreshnessStatus {
        if self.proxied() {
            return self.http.validate_freshness();
        }
        let status = if self.ctx().has_cache_stream() {
            self.compute_freshness()
        } else {
            FreshnessStatus::Undefined
        };
        debug!(
            freshness = ?status,
            age = self.http.cache_age,
            max_age = self.http.cache_max_age,
            "Computed FTP cache freshness"
        );
        self.http.ctx.freshness_status = status;
        status
    }

    fn validate_cache(&mut self) -> Result<ValidationStatus, CacheError> {
        if self.proxied() {
            return self.http.validate_cache();
        }
        let level = self.level();
        if matches!(
            level,
            CacheLevel::Reload | CacheLevel::NoCacheNoStore | CacheLevel::BypassCache
        ) {
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }

        let held = self
            .ctx()
            .entry()
            .filter(|_| self.ctx().has_cache_stream())
            .map(|entry| (entry.stream_size, entry.is_partial, entry.last_modified_at));
        let Some((size, partial, last_modified)) = held else {
            return self.not_in_cache();
        };

        self.http.ctx.cache_stream_offset = 0;
        self.http.ctx.cache_stream_length = Some(size);

        let usable = level != CacheLevel::Revalidate
            && !partial
            && (validate_by_client_policy(&self.http)
                || matches!(level, CacheLevel::CacheOnly | CacheLevel::CacheIfAvailable));
        if usable {
            if self.user_offset > 0 {
                if self.user_offset >= size {
                    return self.not_in_cache();
                }
                self.http.ctx.cache_stream_offset = self.user_offset;
                self.http.ctx.cache_stream_length = Some(size - self.user_offset);
            }
            return Ok(ValidationStatus::ReturnCachedResponse);
        }

        if level == CacheLevel::CacheOnly {
            return Err(CacheError::EntryNotFound);
        }
        if last_modified.is_none() || self.ctx().response_count() > 0 {
            // nothing to compare a status reply against, or already retried
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }
        if partial && self.user_offset >= size {
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }
        self.start_status_query()?;
        Ok(ValidationStatus::Continue)
    }

    fn validate_response(&mut self) -> Result<ValidationStatus, CacheError> {
        if self.proxied() {
            return self.http.validate_response();
        }
        let Some((status, _, _)) = self.live_file_info() else {
            return Err(CacheError::InvalidRequest("no response to validate".into()));
        };
        if !self.status_query || self.ctx().response_count() > 1 || status == FILE_STATUS {
            return Ok(ValidationStatus::Continue);
        }
        if status >= 500 {
            debug!(reply = status, "Status query refused, downloading the whole file");
            self.restore_command(self.user_offset);
            return Ok(ValidationStatus::RetryResponseFromServer);
        }
        Ok(ValidationStatus::Continue)
    }

    fn revalidate_cache(&mut self) -> Result<ValidationStatus, CacheError> {
        if self.proxied() {
            return self.http.revalidate_cache();
        }
        let Some((status, live_modified, live_size)) = self.live_file_info() else {
            return Err(CacheError::InvalidRequest("no response to revalidate".into()));
        };
        let held = self
            .ctx()
            .entry()
            .filter(|_| self.ctx().has_cache_stream())
            .map(|entry| (entry.stream_size, entry.is_partial, entry.last_modified_at));
        let Some((size, partial, last_modified)) = held else {
            return Ok(ValidationStatus::DoNotTakeFromCache);
        };
        if matches!(
            self.level(),
            CacheLevel::Reload | CacheLevel::NoCacheNoStore | CacheLevel::BypassCache
        ) || status != FILE_STATUS
        {
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }

        let user_offset = self.user_offset;
        if last_modified.is_none() || live_modified != last_modified {
            debug!("File changed since it was cached");
            self.restore_command(user_offset);
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }

        if !partial {
            if live_size.is_some_and(|live| live != size) || (user_offset > 0 && user_offset >= size)
            {
                self.restore_command(user_offset);
                return Ok(ValidationStatus::DoNotTakeFromCache);
            }
            self.restore_command(user_offset);
            self.http.ctx.cache_stream_offset = user_offset;
            self.http.ctx.cache_stream_length = Some(size - user_offset);
            return Ok(ValidationStatus::ReturnCachedResponse);
        }

        if user_offset >= size || live_size.is_some_and(|total| total <= size) {
            self.restore_command(user_offset);
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }
        // the transfer resumes right after the cached bytes
        self.restore_command(size);
        self.http.ctx.cache_stream_offset = user_offset;
        self.http.ctx.cache_stream_length = live_size.map(|total| total - user_offset);
        Ok(ValidationStatus::CombineCachedAndServerResponse)
    }

    fn update_cache(&mut self) -> Result<ValidationStatus, CacheError> {
        if self.proxied() {
            return self.http.update_cache();
        }
        let level = self.level();
        if level == CacheLevel::NoCacheNoStore || self.command == FtpCommand::Mutate {
            return Ok(ValidationStatus::RemoveFromCache);
        }
        if matches!(level, CacheLevel::CacheOnly | CacheLevel::BypassCache)
            || self.command == FtpCommand::Other
        {
            return Ok(ValidationStatus::DoNotUpdateCache);
        }
        let validation = self.ctx().validation_status;
        if validation == ValidationStatus::RemoveFromCache {
            return Ok(ValidationStatus::RemoveFromCache);
        }
        let Some((status, live_modified, live_size)) = self.live_file_info() else {
            return Ok(ValidationStatus::DoNotUpdateCache);
        };

        let now = self.ctx().now();
        if validation == ValidationStatus::ReturnCachedResponse && status == FILE_STATUS {
            if let Some(entry) = self.http.ctx.entry_mut() {
                entry.last_synchronized_at = Some(now);
            }
            self.http.ctx.keep_stored_headers = true;
            return Ok(ValidationStatus::UpdateResponseInformation);
        }

        if status == FILE_UNAVAILABLE {
            return Ok(ValidationStatus::RemoveFromCache);
        }
        if status != FILE_STATUS && !DATA_REPLIES.contains(&status) {
            return Ok(ValidationStatus::DoNotUpdateCache);
        }
        let combining = validation == ValidationStatus::CombineCachedAndServerResponse;
        let restarted = self
            .ctx()
            .request()
            .is_some_and(|request| request.content_offset != 0);
        if restarted && !combining {
            // the head of the file is not available to store
            return Ok(ValidationStatus::DoNotUpdateCache);
        }

        let policy = self.http.policy();
        if let Some(entry) = self.http.ctx.entry_mut() {
            entry.last_modified_at = live_modified;
            entry.expires_at = None;
            entry.last_synchronized_at = Some(now);
            entry.max_stale = (policy.level == CacheLevel::Default)
                .then_some(policy.max_stale)
                .flatten();
            entry.stream_size = live_size.unwrap_or(0);
            entry.is_partial = false;
            entry.entry_headers.clear();
        }
        self.http.ctx.store_content_length = live_size;
        self.http.ctx.keep_stored_headers = false;
        Ok(ValidationStatus::CacheResponse)
    }

    fn cached_response(&self) -> Option<CacheResponse> {
        if self.proxied() {
            return self.http.cached_response();
        }
        if !self.ctx().has_cache_stream() {
            return None;
        }
        let entry = self.ctx().entry()?;
        let status = StatusCode::from_u16(TRANSFER_COMPLETE).ok()?;
        let length = self.ctx().cache_stream_length();

        let mut headers = HeaderMap::new();
        if let Some(last_modified) = entry.last_modified_at {
            set_header(&mut headers, LAST_MODIFIED, &format_http_date(last_modified));
        }
        if let Some(length) = length {
            set_header(&mut headers, CONTENT_LENGTH, &length.to_string());
        }
        Some(CacheResponse {
            status,
            version: Version::HTTP_11,
            headers,
            content_length: length,
        })
    }

    fn clear_state(&mut self) {
        self.http.clear_state();
        self.command = FtpCommand::Other;
        self.original_method = None;
        self.user_offset = 0;
        self.status_query = false;
    }

    fn set_response(&mut self, response: CacheResponse) {
        if self.proxied() {
            self.http.set_response(response);
        } else {
            self.http.ctx.set_response(response);
        }
    }
}
