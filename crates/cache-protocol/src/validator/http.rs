//! HTTP validator: parses the cached and live messages and hands the
//! decisions to the RFC 2616 rule set.

use chrono::{DateTime, Utc};
use reqwest::header::{
    AGE, AsHeaderName, CONTENT_LENGTH, CONTENT_RANGE, DATE, EXPIRES, HeaderMap, HeaderName,
    LAST_MODIFIED, WARNING,
};
use reqwest::{StatusCode, Version};
use tracing::debug;

use super::cache_control::CacheControl;
use super::context::ValidatorContext;
use super::headers::{
    ContentRange, WARNING_HEURISTIC, WARNING_STALE, append_header, header_date, header_lines,
    header_str, parse_content_range, parse_header_lines, parse_http_date, parse_seconds, parse_status_line,
    set_header, strip_informational_warnings,
};
use super::rfc2616::{self, UNKNOWN_AGE};
use super::{CacheValidator, FreshnessStatus, ValidationStatus};
use crate::error::CacheError;
use crate::message::{CacheResponse, RequestMethod};
use crate::policy::{CacheLevel, CachePolicy};

const HEURISTIC_WARNING_AGE: i64 = 24 * 60 * 60;

/// Caching attributes read from one message's headers
#[derive(Debug, Clone, Default)]
pub(super) struct MessageInfo {
    pub(super) date: Option<DateTime<Utc>>,
    /// An unparseable `Expires` counts as already expired
    pub(super) expires: Option<DateTime<Utc>>,
    pub(super) last_modified: Option<DateTime<Utc>>,
    pub(super) age: Option<u64>,
    pub(super) cache_control: CacheControl,
    /// Full entity length, from `Content-Range` on a 206
    pub(super) entity_length: Option<u64>,
}

impl MessageInfo {
    fn parse(status: StatusCode, headers: &HeaderMap, declared_length: Option<u64>) -> Self {
        let expires = header_str(headers, EXPIRES)
            .map(|value| parse_http_date(value).unwrap_or(DateTime::UNIX_EPOCH));
        let entity_length = if status == StatusCode::PARTIAL_CONTENT {
            header_str(headers, CONTENT_RANGE)
                .and_then(parse_content_range)
                .and_then(|range| range.total)
        } else {
            declared_length.or_else(|| header_str(headers, CONTENT_LENGTH).and_then(parse_seconds))
        };

        Self {
            date: header_date(headers, DATE),
            expires,
            last_modified: header_date(headers, LAST_MODIFIED),
            age: header_str(headers, AGE).and_then(parse_seconds),
            cache_control: CacheControl::from_headers(headers),
            entity_length,
        }
    }
}

/// The stored response as the validator sees and rewrites it
#[derive(Debug, Clone)]
pub(super) struct CachedMessage {
    /// `None` when no entry is stored or its status line is unreadable
    pub(super) status: Option<StatusCode>,
    pub(super) version: Version,
    pub(super) headers: HeaderMap,
    pub(super) info: MessageInfo,
}

impl Default for CachedMessage {
    fn default() -> Self {
        Self {
            status: None,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            info: MessageInfo::default(),
        }
    }
}

/// Validator implementing RFC 2616 caching for HTTP requests.
#[derive(Debug, Default)]
pub struct HttpValidator {
    pub(super) ctx: ValidatorContext,
    pub(super) method: RequestMethod,
    pub(super) cache: CachedMessage,
    pub(super) live: MessageInfo,
    pub(super) live_range: Option<ContentRange>,
    /// Age of the live response in seconds
    pub(super) response_age: Option<i64>,
    /// Conditional headers added by the validator
    pub(super) if_header1: Option<HeaderName>,
    pub(super) if_header2: Option<HeaderName>,
    /// The caller supplied a `Range` header
    pub(super) range_user: bool,
    /// The validator added a `Range` header for the missing tail
    pub(super) range_cache: bool,
    pub(super) heuristic: bool,
    /// Seconds; `UNKNOWN_AGE` until computed
    pub(super) cache_age: i64,
    pub(super) cache_max_age: i64,
    /// A 304 carried nothing worth rewriting the stored header block for
    pub(super) dont_update_headers: bool,
    /// Driven by the FTP validator through an HTTP proxy
    pub(super) ftp_proxy: bool,
}

impl HttpValidator {
    pub fn new() -> Self {
        Self {
            cache_age: UNKNOWN_AGE,
            ..Default::default()
        }
    }

    pub(super) fn for_ftp_proxy() -> Self {
        Self {
            ftp_proxy: true,
            ..Self::new()
        }
    }

    pub(super) fn policy(&self) -> CachePolicy {
        self.ctx
            .request()
            .map(|request| request.policy.clone())
            .unwrap_or_default()
    }

    pub(super) fn level(&self) -> CacheLevel {
        self.ctx
            .request()
            .map(|request| request.policy.level)
            .unwrap_or_default()
    }

    pub(super) fn request_header<K: AsHeaderName>(&self, name: K) -> Option<&str> {
        self.ctx
            .request()
            .and_then(|request| header_str(&request.headers, name))
    }

    pub(super) fn edit_request(&mut self, edit: impl FnOnce(&mut HeaderMap)) {
        if let Some(request) = self.ctx.request_mut() {
            edit(&mut request.headers);
        }
    }

    pub(super) fn response_status(&self) -> Option<StatusCode> {
        self.ctx.response().map(|response| response.status)
    }

    pub(super) fn is_private_entry(&self) -> bool {
        self.ctx.entry().is_some_and(|entry| entry.is_private)
    }

    pub(super) fn stream_size(&self) -> u64 {
        self.ctx.entry().map_or(0, |entry| entry.stream_size)
    }

    /// No usable stored response is held for this request
    pub(super) fn no_cached_response(&self) -> bool {
        !self.ctx.has_cache_stream() || self.cache.status.is_none()
    }

    fn parse_cached_entry(&mut self) {
        self.cache = CachedMessage::default();
        let Some(entry) = self.ctx.entry() else {
            return;
        };
        let mut lines = entry.entry_headers.iter();
        let Some((version, status)) = lines.next().and_then(|line| parse_status_line(line)) else {
            return;
        };

        let mut headers = parse_header_lines(lines);
        strip_informational_warnings(&mut headers);
        let info = MessageInfo::parse(status, &headers, None);
        self.cache = CachedMessage {
            status: Some(status),
            version,
            headers,
            info,
        };
    }

    /// Copy the working cached message back into the entry for store or update
    fn sync_entry(&mut self) {
        let now = self.ctx.now();
        let policy = self.policy();
        let Some(status) = self.cache.status else {
            return;
        };
        let mut headers = self.cache.headers.clone();
        headers.remove(AGE);
        let lines = header_lines(self.cache.version, status, &headers);
        let expires = header_date(&headers, EXPIRES);
        let last_modified = header_date(&headers, LAST_MODIFIED);

        if let Some(entry) = self.ctx.entry_mut() {
            entry.entry_headers = lines;
            entry.expires_at = expires;
            entry.last_modified_at = last_modified;
            entry.max_stale = (policy.level == CacheLevel::Default)
                .then_some(policy.max_stale)
                .flatten();
            entry.last_synchronized_at = Some(now);
        }
    }

    fn set_age_header(&mut self, age: i64) {
        if age != UNKNOWN_AGE {
            set_header(&mut self.cache.headers, AGE, &age.max(0).to_string());
        }
    }
}

impl CacheValidator for HttpValidator {
    fn context(&self) -> &ValidatorContext {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut ValidatorContext {
        &mut self.ctx
    }

    fn validate_request(&mut self) -> Result<ValidationStatus, CacheError> {
        let Some(request) = self.ctx.request() else {
            return Err(CacheError::InvalidRequest("no request to validate".into()));
        };
        self.method = RequestMethod::classify(&request.method);

        if self.level() == CacheLevel::BypassCache {
            return Ok(ValidationStatus::DoNotUseCache);
        }
        if self.ctx.response_count() > 0 {
            // a resend carries the corrected headers as they are
            debug!("Resending without consulting the cache");
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }
        rfc2616::on_validate_request(self)
    }

    fn validate_freshness(&mut self) -> FreshnessStatus {
        self.parse_cached_entry();
        let status = if self.no_cached_response() {
            FreshnessStatus::Undefined
        } else {
            rfc2616::on_validate_freshness(self)
        };
        debug!(
            freshness = ?status,
            age = self.cache_age,
            max_age = self.cache_max_age,
            "Computed cache freshness"
        );
        self.ctx.freshness_status = status;
        status
    }

    fn validate_cache(&mut self) -> Result<ValidationStatus, CacheError> {
        let level = self.level();
        if matches!(
            level,
            CacheLevel::Reload
                | CacheLevel::NoCacheNoStore
                | CacheLevel::Refresh
                | CacheLevel::BypassCache
        ) {
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }

        if self.no_cached_response() || self.cache.status == Some(StatusCode::NOT_MODIFIED) {
            if level == CacheLevel::CacheOnly {
                return Err(CacheError::EntryNotFound);
            }
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }

        self.ctx.cache_stream_offset = 0;
        self.ctx.cache_stream_length = if self.method == RequestMethod::Head {
            Some(0)
        } else {
            Some(self.stream_size())
        };

        let status = rfc2616::on_validate_cache(self);
        if status != ValidationStatus::ReturnCachedResponse {
            if level == CacheLevel::CacheOnly {
                return Err(CacheError::EntryNotFound);
            }
            return Ok(status);
        }

        if self.ctx.freshness_status == FreshnessStatus::Stale {
            append_header(&mut self.cache.headers, WARNING, WARNING_STALE);
        }
        if self.heuristic && self.cache_age != UNKNOWN_AGE && self.cache_age >= HEURISTIC_WARNING_AGE
        {
            append_header(&mut self.cache.headers, WARNING, WARNING_HEURISTIC);
        }
        self.set_age_header(self.cache_age);
        Ok(status)
    }

    fn validate_response(&mut self) -> Result<ValidationStatus, CacheError> {
        if self.ctx.response().is_none() {
            return Err(CacheError::InvalidRequest("no response to validate".into()));
        }
        if self.no_cached_response() {
            return Ok(ValidationStatus::Continue);
        }
        Ok(rfc2616::on_validate_response(self))
    }

    fn revalidate_cache(&mut self) -> Result<ValidationStatus, CacheError> {
        let Some(status) = self.response_status() else {
            return Err(CacheError::InvalidRequest("no response to revalidate".into()));
        };
        if self.no_cached_response()
            || matches!(
                self.level(),
                CacheLevel::BypassCache | CacheLevel::NoCacheNoStore
            )
        {
            return Ok(ValidationStatus::DoNotTakeFromCache);
        }

        if status.is_server_error() {
            let result = rfc2616::validate_on_5xx(self);
            if result == ValidationStatus::ReturnCachedResponse {
                self.ctx.cache_stream_offset = 0;
                self.ctx.cache_stream_length = Some(self.stream_size());
                self.set_age_header(0);
            }
            return Ok(result);
        }

        let result = rfc2616::validate_cache_after_response(self);
        if result == ValidationStatus::ReturnCachedResponse {
            let now = self.ctx.now();
            let age = self
                .live
                .date
                .map_or(0, |date| (now - date).num_seconds().max(0));
            self.ctx.cache_stream_offset = 0;
            self.ctx.cache_stream_length = if self.method == RequestMethod::Head {
                Some(0)
            } else {
                Some(self.stream_size())
            };
            self.set_age_header(age);
        }
        Ok(result)
    }

    fn update_cache(&mut self) -> Result<ValidationStatus, CacheError> {
        match self.level() {
            CacheLevel::NoCacheNoStore => return Ok(ValidationStatus::RemoveFromCache),
            CacheLevel::CacheOnly | CacheLevel::BypassCache => {
                return Ok(ValidationStatus::DoNotUpdateCache);
            }
            _ => {}
        }
        let Some(response) = self.ctx.response() else {
            return Ok(ValidationStatus::DoNotUpdateCache);
        };
        let response_status = response.status;
        let response_length = response.content_length;

        // the entry masked a server error and stays as it was
        if response_status.is_server_error()
            && self.ctx.validation_status == ValidationStatus::ReturnCachedResponse
        {
            return Ok(ValidationStatus::DoNotUpdateCache);
        }

        let status = rfc2616::on_update_cache(self);
        match status {
            ValidationStatus::CacheResponse => {
                self.sync_entry();
                self.ctx.keep_stored_headers = false;
                self.ctx.store_content_length = if response_status == StatusCode::PARTIAL_CONTENT {
                    self.cache.info.entity_length
                } else {
                    response_length
                };
            }
            ValidationStatus::UpdateResponseInformation => {
                self.ctx.keep_stored_headers = self.dont_update_headers;
                if !self.dont_update_headers {
                    self.sync_entry();
                }
            }
            _ => {}
        }
        Ok(status)
    }

    fn cached_response(&self) -> Option<CacheResponse> {
        let status = self.cache.status?;
        let content_length = header_str(&self.cache.headers, CONTENT_LENGTH)
            .and_then(parse_seconds)
            .or(self.ctx.cache_stream_length);
        Some(CacheResponse {
            status,
            version: self.cache.version,
            headers: self.cache.headers.clone(),
            content_length,
        })
    }

    fn clear_state(&mut self) {
        let ctx = std::mem::take(&mut self.ctx);
        *self = Self {
            ctx,
            ftp_proxy: self.ftp_proxy,
            ..Self::new()
        };
    }

    fn set_response(&mut self, response: CacheResponse) {
        let now = self.ctx.now();
        self.live = MessageInfo::parse(response.status, &response.headers, response.content_length);
        self.live_range = (response.status == StatusCode::PARTIAL_CONTENT)
            .then(|| header_str(&response.headers, CONTENT_RANGE).and_then(parse_content_range))
            .flatten();
        self.response_age = self
            .live
            .age
            .map(|age| i64::try_from(age).unwrap_or(i64::MAX))
            .or_else(|| self.live.date.map(|date| (now - date).num_seconds().max(0)));
        self.ctx.set_response(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, CacheKey};
    use crate::message::CacheRequest;
    use crate::policy::CachePolicy;
    use crate::validator::headers::format_http_date;
    use chrono::TimeDelta;
    use reqwest::Method;
    use reqwest::header::{IF_NONE_MATCH, IF_RANGE, RANGE};

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

    fn entry(lines: &[String], stream_size: u64) -> CacheEntry {
        let mut entry = CacheEntry::new(true);
        entry.entry_headers = lines.to_vec();
        entry.stream_size = stream_size;
        entry
    }

    fn start(request: CacheRequest) -> HttpValidator {
        init_tracing();
        let mut validator = HttpValidator::new();
        validator.context_mut().set_now(now());
        validator.fetch_request(CacheKey::from(&request.uri), request);
        validator
    }

    fn get(url: &str) -> CacheRequest {
        CacheRequest::get(url::Url::parse(url).unwrap())
    }

    /// Runs the pre-request phases and returns the `validate_cache` outcome
    fn lookup(
        validator: &mut HttpValidator,
        entry: Option<CacheEntry>,
    ) -> Result<ValidationStatus, CacheError> {
        assert_eq!(validator.validate_request()?, ValidationStatus::Continue);
        validator.fetch_cache_entry(entry, true);
        validator.validate_freshness();
        validator.validate_cache()
    }

    #[test]
    fn fresh_entry_is_returned_with_age() {
        let mut v = start(get("http://example.com/a"));
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(600)),
            "Cache-Control: max-age=3600".to_string(),
            "Content-Length: 5".to_string(),
        ];
        let status = lookup(&mut v, Some(entry(&lines, 5))).unwrap();
        assert_eq!(v.context().freshness_status(), FreshnessStatus::Fresh);
        assert_eq!(status, ValidationStatus::ReturnCachedResponse);

        let cached = v.cached_response().unwrap();
        assert_eq!(cached.status, StatusCode::OK);
        assert_eq!(header_str(&cached.headers, AGE), Some("600"));
        assert!(cached.headers.get(WARNING).is_none());
        assert_eq!(v.context().cache_stream_length(), Some(5));
    }

    fn must_revalidate_lines() -> Vec<String> {
        vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(7200)),
            "Cache-Control: max-age=60, must-revalidate".to_string(),
            "ETag: \"v1\"".to_string(),
            "Content-Length: 5".to_string(),
        ]
    }

    #[test]
    fn stale_must_revalidate_builds_conditional_request() {
        let mut v = start(get("http://example.com/a"));
        let status = lookup(&mut v, Some(entry(&must_revalidate_lines(), 5))).unwrap();
        assert_eq!(v.context().freshness_status(), FreshnessStatus::Stale);
        assert_eq!(status, ValidationStatus::Continue);
        assert_eq!(v.request_header(IF_NONE_MATCH), Some("\"v1\""));
    }

    #[test]
    fn not_modified_returns_cache_and_updates_metadata() {
        let mut v = start(get("http://example.com/a"));
        lookup(&mut v, Some(entry(&must_revalidate_lines(), 5))).unwrap();

        v.set_response(
            CacheResponse::new(StatusCode::NOT_MODIFIED)
                .with_header("Date", ago(5))
                .with_header("ETag", "\"v1\""),
        );
        assert_eq!(v.validate_response().unwrap(), ValidationStatus::Continue);
        assert!(v.request_header(IF_NONE_MATCH).is_none());

        let status = v.revalidate_cache().unwrap();
        assert_eq!(status, ValidationStatus::ReturnCachedResponse);
        let cached = v.cached_response().unwrap();
        assert_eq!(cached.status, StatusCode::OK);
        assert_eq!(header_str(&cached.headers, AGE), Some("5"));
        assert_eq!(header_str(&cached.headers, CONTENT_LENGTH), Some("5"));

        v.context_mut().validation_status = status;
        assert_eq!(
            v.update_cache().unwrap(),
            ValidationStatus::UpdateResponseInformation
        );
        let entry = v.context().entry().unwrap();
        assert_eq!(entry.last_synchronized_at, Some(now()));
        assert!(entry.entry_headers.iter().any(|l| l.starts_with("Date:")));
    }

    #[test]
    fn cache_only_without_entry_fails() {
        let mut v = start(
            get("http://example.com/missing").with_policy(CachePolicy::new(CacheLevel::CacheOnly)),
        );
        let err = lookup(&mut v, None).unwrap_err();
        assert!(matches!(err, CacheError::EntryNotFound));
        assert_eq!(v.context().freshness_status(), FreshnessStatus::Undefined);
    }

    fn partial_lines() -> Vec<String> {
        vec![
            "HTTP/1.1 206 Partial Content".to_string(),
            format!("Date: {}", ago(10)),
            "Cache-Control: max-age=3600".to_string(),
            "ETag: \"v1\"".to_string(),
            "Content-Range: bytes 0-999/3000".to_string(),
            "Content-Length: 1000".to_string(),
        ]
    }

    fn merge_partial(live_range: &str) -> HttpValidator {
        let mut v = start(get("http://example.com/big"));
        let mut stored = entry(&partial_lines(), 1000);
        stored.is_partial = true;
        assert_eq!(lookup(&mut v, Some(stored)).unwrap(), ValidationStatus::Continue);
        assert_eq!(v.request_header(RANGE), Some("bytes=1000-"));
        assert_eq!(v.request_header(IF_RANGE), Some("\"v1\""));

        v.set_response(
            CacheResponse::new(StatusCode::PARTIAL_CONTENT)
                .with_header("Date", ago(0))
                .with_header("ETag", "\"v1\"")
                .with_header("Content-Range", live_range),
        );
        assert_eq!(v.validate_response().unwrap(), ValidationStatus::Continue);
        let status = v.revalidate_cache().unwrap();
        assert_eq!(status, ValidationStatus::CombineCachedAndServerResponse);
        v.context_mut().validation_status = status;
        assert_eq!(v.update_cache().unwrap(), ValidationStatus::CacheResponse);
        v
    }

    #[test]
    fn partial_merge_stays_partial_until_complete() {
        let v = merge_partial("bytes 1000-1999/3000");
        let entry = v.context().entry().unwrap();
        assert_eq!(entry.stream_size, 2000);
        assert!(entry.is_partial);
        assert_eq!(v.cache.status, Some(StatusCode::PARTIAL_CONTENT));
        assert_eq!(
            header_str(&v.cache.headers, CONTENT_RANGE),
            Some("bytes 0-1999/3000")
        );
        assert_eq!(v.context().store_content_length(), Some(3000));
    }

    #[test]
    fn partial_merge_reaching_total_becomes_ok() {
        let v = merge_partial("bytes 1000-2999/3000");
        let entry = v.context().entry().unwrap();
        assert_eq!(entry.stream_size, 3000);
        assert!(!entry.is_partial);
        assert_eq!(v.cache.status, Some(StatusCode::OK));
        assert!(v.cache.headers.get(CONTENT_RANGE).is_none());
        assert_eq!(header_str(&v.cache.headers, CONTENT_LENGTH), Some("3000"));
        assert_eq!(entry.entry_headers[0], "HTTP/1.1 200 OK");
    }

    #[test]
    fn server_error_falls_back_to_fresh_cache_with_warning() {
        let mut v = start(get("http://example.com/a"));
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(30)),
            "Cache-Control: max-age=3600".to_string(),
            "Content-Length: 5".to_string(),
        ];
        let mut stored = entry(&lines, 5);
        stored.last_modified_at = Some(now() - TimeDelta::days(1));
        let policy = CachePolicy::new(CacheLevel::Revalidate);
        v.context_mut().request_mut().unwrap().policy = policy;
        assert_eq!(lookup(&mut v, Some(stored)).unwrap(), ValidationStatus::Continue);

        v.set_response(CacheResponse::new(StatusCode::SERVICE_UNAVAILABLE));
        v.validate_response().unwrap();
        assert_eq!(
            v.revalidate_cache().unwrap(),
            ValidationStatus::ReturnCachedResponse
        );
        let cached = v.cached_response().unwrap();
        assert_eq!(header_str(&cached.headers, AGE), Some("0"));
        assert!(
            header_str(&cached.headers, WARNING)
                .is_some_and(|w| w.starts_with("111"))
        );
    }

    #[test]
    fn masked_server_error_leaves_entry_untouched() {
        let mut v = start(get("http://example.com/a"));
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(30)),
            "Cache-Control: max-age=3600".to_string(),
            "ETag: \"v1\"".to_string(),
            "Content-Length: 5".to_string(),
        ];
        v.context_mut().request_mut().unwrap().policy = CachePolicy::new(CacheLevel::Revalidate);
        assert_eq!(lookup(&mut v, Some(entry(&lines, 5))).unwrap(), ValidationStatus::Continue);

        // cacheable on its own, but it only reached the caller through the entry
        v.set_response(
            CacheResponse::new(StatusCode::SERVICE_UNAVAILABLE)
                .with_header("Date", ago(0))
                .with_header("Cache-Control", "max-age=60"),
        );
        v.validate_response().unwrap();
        let status = v.revalidate_cache().unwrap();
        assert_eq!(status, ValidationStatus::ReturnCachedResponse);
        v.context_mut().validation_status = status;
        assert_eq!(v.update_cache().unwrap(), ValidationStatus::DoNotUpdateCache);
        assert_eq!(v.cached_response().unwrap().status, StatusCode::OK);
        assert_eq!(v.context().entry().unwrap().entry_headers, lines);
    }

    #[test]
    fn content_range_end_at_integer_limit_is_not_merged() {
        let mut v = start(get("http://example.com/big"));
        let mut stored = entry(&partial_lines(), 1000);
        stored.is_partial = true;
        assert_eq!(lookup(&mut v, Some(stored)).unwrap(), ValidationStatus::Continue);

        v.set_response(
            CacheResponse::new(StatusCode::PARTIAL_CONTENT)
                .with_header("Date", ago(0))
                .with_header("ETag", "\"v1\"")
                .with_header("Content-Range", format!("bytes 1000-{}/*", u64::MAX)),
        );
        assert_eq!(v.validate_response().unwrap(), ValidationStatus::Continue);
        let status = v.revalidate_cache().unwrap();
        assert_eq!(status, ValidationStatus::DoNotTakeFromCache);
        v.context_mut().validation_status = status;
        assert_ne!(v.update_cache().unwrap(), ValidationStatus::CacheResponse);
    }

    #[test]
    fn post_is_not_taken_from_cache() {
        let request = CacheRequest::new(Method::POST, url::Url::parse("http://example.com/").unwrap());
        let mut v = start(request);
        assert_eq!(
            v.validate_request().unwrap(),
            ValidationStatus::DoNotTakeFromCache
        );
    }

    #[test]
    fn heuristic_lifetime_adds_warning_when_old() {
        let mut v = start(get("http://example.com/a").with_policy(CachePolicy::new(CacheLevel::CacheIfAvailable)));
        let lines = vec![
            "HTTP/1.1 200 OK".to_string(),
            format!("Date: {}", ago(2 * 86_400)),
            format!("Last-Modified: {}", ago(400 * 86_400)),
        ];
        let status = lookup(&mut v, Some(entry(&lines, 5))).unwrap();
        assert_eq!(status, ValidationStatus::ReturnCachedResponse);
        // 10% of 400 days is well over two days
        assert_eq!(v.context().freshness_status(), FreshnessStatus::Fresh);
        let warnings: Vec<_> = v
            .cached_response()
            .unwrap()
            .headers
            .get_all(WARNING)
            .iter()
            .filter_map(|w| w.to_str().ok().map(str::to_string))
            .collect();
        assert_eq!(warnings, vec![WARNING_HEURISTIC.to_string()]);
    }
}
