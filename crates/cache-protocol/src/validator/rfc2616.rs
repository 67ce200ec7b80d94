//! RFC 2616 caching rules.
//!
//! Stateless functions over an [`HttpValidator`]; they read the parsed cached
//! and live messages, rewrite request and cached headers, and return the
//! outcome for the calling phase. No I/O happens here.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::Version;
use reqwest::header::{
    AGE, AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_LOCATION, CONTENT_RANGE,
    DATE, ETAG, EXPIRES, HeaderMap, HeaderName, IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_RANGE,
    IF_UNMODIFIED_SINCE, LAST_MODIFIED, PRAGMA, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, RANGE, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE, VARY, VIA, WARNING,
};
use tracing::{debug, warn};

use super::headers::{
    CONTENT_MD5, KEEP_ALIVE, RangeSpec, WARNING_REVALIDATION_FAILED, append_header,
    format_content_range, format_http_date, header_list, header_str, parse_range_request,
    set_header, split_list,
};
use super::http::HttpValidator;
use super::{FreshnessStatus, ValidationStatus};
use crate::error::CacheError;
use crate::message::RequestMethod;
use crate::policy::CacheLevel;

/// Age sentinel for an entry whose age cannot be recovered
pub(super) const UNKNOWN_AGE: i64 = i64::MAX;

const HOP_BY_HOP: [HeaderName; 8] = [
    CONNECTION,
    KEEP_ALIVE,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRANSFER_ENCODING,
    TRAILER,
    UPGRADE,
];

/// Headers a 304 may carry without changing the stored header block
const REVALIDATION_ONLY: [HeaderName; 7] = [
    ETAG,
    CONTENT_LOCATION,
    AGE,
    LAST_MODIFIED,
    EXPIRES,
    DATE,
    VIA,
];

const USER_CONDITIONALS: [HeaderName; 5] = [
    IF_MODIFIED_SINCE,
    IF_NONE_MATCH,
    IF_RANGE,
    IF_MATCH,
    IF_UNMODIFIED_SINCE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TriState {
    Valid,
    Invalid,
    Unknown,
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn fresh_if(fresh: bool) -> FreshnessStatus {
    if fresh {
        FreshnessStatus::Fresh
    } else {
        FreshnessStatus::Stale
    }
}

/// Request phase: method and conditional checks, then the request cache
/// directives derived from the policy level.
pub(super) fn on_validate_request(v: &mut HttpValidator) -> Result<ValidationStatus, CacheError> {
    let mut result = validate_request_common(v)?;
    if result == ValidationStatus::DoNotUseCache {
        return Ok(result);
    }

    // Pragma and Cache-Control on the request are owned by the cache
    v.edit_request(|headers| {
        headers.remove(PRAGMA);
        headers.remove(CACHE_CONTROL);
    });

    let policy = v.policy();
    let mut directives: Vec<String> = Vec::new();
    let mut pragma_no_cache = false;

    if policy.level == CacheLevel::NoCacheNoStore {
        directives.extend(["no-store".into(), "no-cache".into()]);
        pragma_no_cache = true;
        result = ValidationStatus::DoNotTakeFromCache;
    } else if result == ValidationStatus::Continue {
        match policy.level {
            CacheLevel::Reload => {
                directives.push("no-cache".into());
                pragma_no_cache = true;
                result = ValidationStatus::DoNotTakeFromCache;
            }
            CacheLevel::Refresh => {
                directives.push("max-age=0".into());
                pragma_no_cache = true;
                result = ValidationStatus::DoNotTakeFromCache;
            }
            CacheLevel::Default => {
                if let Some(min_fresh) = policy.min_fresh.filter(|d| !d.is_zero()) {
                    directives.push(format!("min-fresh={}", min_fresh.as_secs()));
                }
                if let Some(max_age) = policy.max_age {
                    directives.push(format!("max-age={}", max_age.as_secs()));
                }
                if let Some(max_stale) = policy.max_stale.filter(|d| !d.is_zero()) {
                    directives.push(format!("max-stale={}", max_stale.as_secs()));
                }
            }
            CacheLevel::CacheOnly | CacheLevel::CacheOrNextCacheOnly => {
                directives.push("only-if-cached".into());
            }
            _ => {}
        }
    }

    v.edit_request(|headers| {
        for directive in &directives {
            append_header(headers, CACHE_CONTROL, directive);
        }
        if pragma_no_cache {
            append_header(headers, PRAGMA, "no-cache");
        }
    });
    Ok(result)
}

fn validate_request_common(v: &HttpValidator) -> Result<ValidationStatus, CacheError> {
    let cache_only = v.level() == CacheLevel::CacheOnly;
    let outcome = |status| {
        if cache_only {
            Err(CacheError::ProhibitedByPolicy)
        } else {
            Ok(status)
        }
    };

    if v.method.invalidates_entry() {
        return outcome(ValidationStatus::DoNotTakeFromCache);
    }
    if !matches!(v.method, RequestMethod::Head | RequestMethod::Get) {
        return outcome(ValidationStatus::DoNotUseCache);
    }
    if USER_CONDITIONALS
        .iter()
        .any(|name| v.request_header(name).is_some())
    {
        // the caller's own validators would conflict with ours
        return outcome(ValidationStatus::DoNotTakeFromCache);
    }
    Ok(ValidationStatus::Continue)
}

pub(super) fn on_validate_freshness(v: &mut HttpValidator) -> FreshnessStatus {
    let result = compute_freshness(v);

    let has_query = v.ctx.request().is_some_and(|request| request.has_query());
    if has_query {
        let cc = &v.cache.info.cache_control;
        let explicit = if v.is_private_entry() {
            cc.max_age
        } else {
            cc.s_maxage
        };
        if v.cache.info.expires.is_none() && explicit.is_none() {
            return FreshnessStatus::Stale;
        }
        if v.cache.version < Version::HTTP_11 {
            return FreshnessStatus::Stale;
        }
    }
    result
}

/// Compute `cache_age` and `cache_max_age` and compare them.
///
/// Lifetime priority: s-maxage (shared entries), max-age, Expires minus Date,
/// absolute Expires, 10% of the time since Last-Modified, the unspecified
/// default.
pub(super) fn compute_freshness(v: &mut HttpValidator) -> FreshnessStatus {
    let now = v.ctx.now();
    let (entry_sync, entry_expires, entry_modified) = v
        .ctx
        .entry()
        .map(|e| (e.last_synchronized_at, e.expires_at, e.last_modified_at))
        .unwrap_or_default();
    let header_age = v
        .cache
        .info
        .age
        .map(|age| i64::try_from(age).unwrap_or(i64::MAX));

    let mut age = UNKNOWN_AGE;
    if let Some(date) = v.cache.info.date {
        age = (now - date).num_seconds();
    } else if let Some(sync) = entry_sync {
        age = (now - sync)
            .num_seconds()
            .saturating_add(header_age.unwrap_or(0));
    }
    if let Some(header_age) = header_age {
        if header_age > age || age == UNKNOWN_AGE {
            age = header_age;
        }
    }
    let age = age.max(0);
    v.cache_age = age;

    let cc = &v.cache.info.cache_control;
    if !v.is_private_entry() {
        if let Some(s_maxage) = cc.s_maxage {
            v.cache_max_age = i64::try_from(s_maxage).unwrap_or(i64::MAX);
            return fresh_if(age < v.cache_max_age);
        }
    }
    if let Some(max_age) = cc.max_age {
        v.cache_max_age = i64::try_from(max_age).unwrap_or(i64::MAX);
        return fresh_if(age < v.cache_max_age);
    }

    let date = v.cache.info.date.or(entry_sync);
    let expires = match (entry_expires, v.cache.info.expires) {
        (Some(stored), Some(header)) => Some(stored.min(header)),
        (stored, header) => stored.or(header),
    };
    if let (Some(expires), Some(date)) = (expires, date) {
        v.cache_max_age = (expires - date).num_seconds();
        return fresh_if(age < v.cache_max_age);
    }
    if let Some(expires) = expires {
        v.cache_max_age = (expires - now).num_seconds();
        return fresh_if(now < expires);
    }

    v.heuristic = true;
    if let Some(last_modified) = entry_modified.max(v.cache.info.last_modified) {
        v.cache_max_age = (now - last_modified).num_seconds() / 10;
        return fresh_if(age < v.cache_max_age);
    }
    v.cache_max_age = secs(v.ctx.unspecified_max_age());
    fresh_if(v.cache_max_age >= age)
}

/// First decision point, before any live request
pub(super) fn on_validate_cache(v: &mut HttpValidator) -> ValidationStatus {
    if validate_by_vary(v) == TriState::Invalid {
        debug!("Vary selecting headers do not match the cached entry");
        return ValidationStatus::DoNotTakeFromCache;
    }

    let level = v.level();
    if level == CacheLevel::Revalidate {
        return try_conditional_request(v);
    }

    if validate_by_special_cases(v) == TriState::Invalid {
        if level == CacheLevel::CacheOnly {
            return ValidationStatus::DoNotTakeFromCache;
        }
        return try_conditional_request(v);
    }

    let enough_fresh = validate_by_client_policy(v);
    if enough_fresh
        || matches!(
            level,
            CacheLevel::CacheOnly | CacheLevel::CacheIfAvailable | CacheLevel::CacheOrNextCacheOnly
        )
    {
        let result = try_response_from_cache(v);
        if result != ValidationStatus::ReturnCachedResponse && level == CacheLevel::CacheOnly {
            return ValidationStatus::DoNotTakeFromCache;
        }
        return result;
    }
    try_conditional_request(v)
}

/// Check the live response, demanding an unconditional resend when it
/// contradicts the cached one.
pub(super) fn on_validate_response(v: &mut HttpValidator) -> ValidationStatus {
    if v.ctx.response_count() > 1 || v.range_user {
        return ValidationStatus::Continue;
    }
    let Some((status, version)) = v
        .ctx
        .response()
        .map(|response| (response.status, response.version))
    else {
        return ValidationStatus::Continue;
    };

    if let (Some(cached), Some(live)) = (v.cache.info.date, v.live.date) {
        if cached > live {
            debug!("Live response is older than the cached one");
            return retry_unconditionally(v);
        }
    }

    if v.range_cache && status == StatusCode::RANGE_NOT_SATISFIABLE {
        return retry_unconditionally(v);
    }

    if status == StatusCode::NOT_MODIFIED && (v.if_header1.is_none() || v.range_cache) {
        warn!("Unexpected 304 for a request the cache did not make conditional");
        return retry_unconditionally(v);
    }

    if v.cache.version < Version::HTTP_11
        && version < Version::HTTP_11
        && v.cache.info.last_modified > v.live.last_modified
    {
        return retry_unconditionally(v);
    }

    let policy = v.policy();
    if policy.level == CacheLevel::Default {
        if let Some(response_age) = v.response_age {
            let now = v.ctx.now();
            let too_old = policy.max_age.is_some_and(|max| response_age > secs(max));
            let expires_too_soon = v.live.expires.is_some_and(|expires| {
                policy
                    .min_fresh
                    .is_some_and(|min| (expires - now).num_seconds() < secs(min))
            });
            let too_stale = v.live.expires.is_some_and(|expires| {
                policy
                    .max_stale
                    .is_some_and(|max| (now - expires).num_seconds() > secs(max))
            });
            if too_old || expires_too_soon || too_stale {
                debug!(response_age, "Live response does not fit the client policy");
                return retry_unconditionally(v);
            }
        }
    }

    // the request may be resubmitted for auth or redirects
    remove_cache_conditionals(v);
    ValidationStatus::Continue
}

fn retry_unconditionally(v: &mut HttpValidator) -> ValidationStatus {
    construct_unconditional_refresh(v);
    ValidationStatus::RetryResponseFromServer
}

fn remove_cache_conditionals(v: &mut HttpValidator) {
    let header1 = v.if_header1.take();
    let header2 = v.if_header2.take();
    let range = std::mem::take(&mut v.range_cache);
    v.edit_request(|headers| {
        for name in header1.into_iter().chain(header2) {
            headers.remove(name);
        }
        if range {
            headers.remove(RANGE);
        }
    });
}

/// Decide what to persist from the live response
pub(super) fn on_update_cache(v: &mut HttpValidator) -> ValidationStatus {
    if v.cache.status == Some(StatusCode::NOT_MODIFIED) {
        warn!("Removing a cache entry that holds a bare 304");
        return ValidationStatus::RemoveFromCache;
    }
    if v.ctx.validation_status == ValidationStatus::RemoveFromCache {
        return ValidationStatus::RemoveFromCache;
    }

    let no_update = if v.method.invalidates_entry() || v.method == RequestMethod::Other {
        ValidationStatus::RemoveFromCache
    } else {
        ValidationStatus::DoNotUpdateCache
    };

    if update_eligibility(v) != TriState::Valid {
        return no_update;
    }

    let Some((status, version)) = v
        .ctx
        .response()
        .map(|response| (response.status, response.version))
    else {
        return no_update;
    };

    if let Some(entry) = v.ctx.entry_mut() {
        entry.is_partial = false;
    }

    if status == StatusCode::NOT_MODIFIED || v.method == RequestMethod::Head {
        if v.dont_update_headers {
            let now = v.ctx.now();
            let policy = v.policy();
            let (expires, last_modified) = (v.live.expires, v.live.last_modified);
            if let Some(entry) = v.ctx.entry_mut() {
                entry.expires_at = expires;
                entry.last_modified_at = last_modified;
                entry.max_stale = (policy.level == CacheLevel::Default)
                    .then_some(policy.max_stale)
                    .flatten();
                entry.last_synchronized_at = Some(now);
            }
        }
        return ValidationStatus::UpdateResponseInformation;
    }

    if status == StatusCode::PARTIAL_CONTENT {
        // only a strictly appended range can extend the held bytes
        let held = if v.ctx.has_cache_stream() {
            v.stream_size()
        } else {
            0
        };
        let Some(range) = v.live_range else {
            return no_update;
        };
        if range.start != held {
            debug!(
                held,
                range_start = range.start,
                "Partial response does not extend the cached bytes"
            );
            return no_update;
        }

        if !v.range_user {
            v.ctx.cache_stream_offset = 0;
        }
        replace_or_update_headers(v);
        v.cache.version = version;
        v.cache.info.entity_length = v.live.entity_length;
        let Some(size) = range.end.checked_add(1) else {
            return no_update;
        };
        v.ctx.cache_stream_length = Some(size);
        if let Some(entry) = v.ctx.entry_mut() {
            entry.stream_size = size;
        }
        if v.cache.info.entity_length == Some(size) {
            construct_200(v);
        } else {
            construct_206(v, 0);
        }
        return ValidationStatus::CacheResponse;
    }

    replace_or_update_headers(v);
    v.cache.version = version;
    v.cache.status = Some(status);
    let length = v.ctx.response().and_then(|response| response.content_length);
    if let Some(entry) = v.ctx.entry_mut() {
        entry.stream_size = length.unwrap_or(0);
    }
    ValidationStatus::CacheResponse
}

/// Whether the live response may be stored at all
fn update_eligibility(v: &mut HttpValidator) -> TriState {
    if !matches!(
        v.method,
        RequestMethod::Head | RequestMethod::Get | RequestMethod::Post
    ) {
        return TriState::Unknown;
    }
    let Some((status, has_etag, has_expires)) = v.ctx.response().map(|response| {
        (
            response.status,
            response.headers.contains_key(ETAG),
            response.headers.contains_key(EXPIRES),
        )
    }) else {
        return TriState::Unknown;
    };

    if v.no_cached_response() && (status == StatusCode::NOT_MODIFIED || v.method == RequestMethod::Head)
    {
        return TriState::Unknown;
    }

    let cc = v.live.cache_control.clone();
    if cc.no_store {
        return TriState::Unknown;
    }
    if let (Some(live), Some(cached)) = (v.live.date, v.cache.info.date) {
        if live < cached {
            return TriState::Unknown;
        }
    }
    if cc.public {
        return TriState::Valid;
    }

    let mut result = TriState::Unknown;
    if cc.private {
        if v.is_private_entry() {
            result = TriState::Valid;
        } else {
            if cc.private_headers.is_empty() {
                return TriState::Unknown;
            }
            for name in &cc.private_headers {
                v.cache.headers.remove(name.as_str());
            }
            result = TriState::Valid;
        }
    }

    if cc.no_cache {
        if v.live.last_modified.is_none() && !has_etag {
            return TriState::Unknown;
        }
        return TriState::Valid;
    }
    if cc.s_maxage.is_some() || cc.max_age.is_some() {
        return TriState::Valid;
    }
    if !v.is_private_entry() && v.request_header(AUTHORIZATION).is_some() {
        return TriState::Unknown;
    }
    if v.method == RequestMethod::Post && !has_expires {
        return TriState::Unknown;
    }
    if matches!(
        status.as_u16(),
        200 | 203 | 206 | 300 | 301 | 304 | 410
    ) {
        return TriState::Valid;
    }
    result
}

/// Client policy fit, evaluated only at `CacheLevel::Default`
pub(super) fn validate_by_client_policy(v: &HttpValidator) -> bool {
    let policy = v.policy();
    if policy.level == CacheLevel::Default {
        if let Some(min_fresh) = policy.min_fresh.filter(|d| !d.is_zero()) {
            if v.cache_age.saturating_add(secs(min_fresh)) >= v.cache_max_age {
                return false;
            }
        }
        if let Some(max_age) = policy.max_age {
            if v.cache_age >= secs(max_age) {
                return false;
            }
        }
        if let Some(sync_date) = policy.cache_sync_date {
            let synced = v.ctx.entry().and_then(|entry| entry.last_synchronized_at);
            if synced.is_none_or(|synced| synced < sync_date) {
                return false;
            }
        }
        if let Some(max_stale) = policy.max_stale.filter(|d| !d.is_zero()) {
            let adjusted = v.cache_max_age.saturating_add(secs(max_stale));
            return v.cache_age < adjusted;
        }
    }
    v.ctx.freshness_status == FreshnessStatus::Fresh
}

/// no-cache, must-revalidate, proxy-revalidate and Authorization rules.
///
/// `Invalid` means the entry needs revalidation before use.
pub(super) fn validate_by_special_cases(v: &mut HttpValidator) -> TriState {
    let cc = v.cache.info.cache_control.clone();
    let fresh = v.ctx.freshness_status == FreshnessStatus::Fresh;
    let private_entry = v.is_private_entry();

    if cc.no_cache {
        if cc.no_cache_headers.is_empty() {
            return TriState::Invalid;
        }
        for name in &cc.no_cache_headers {
            v.cache.headers.remove(name.as_str());
        }
    }

    if (cc.must_revalidate || (!private_entry && cc.proxy_revalidate)) && !fresh {
        return TriState::Invalid;
    }

    if v.request_header(AUTHORIZATION).is_some() {
        if !fresh {
            return TriState::Invalid;
        }
        if !private_entry && cc.s_maxage.is_none() && !cc.must_revalidate && !cc.public {
            return TriState::Invalid;
        }
    }
    TriState::Valid
}

/// Second decision point for non-5xx live responses
pub(super) fn validate_cache_after_response(v: &mut HttpValidator) -> ValidationStatus {
    let Some(response) = v.ctx.response() else {
        return ValidationStatus::DoNotTakeFromCache;
    };
    let status = response.status;
    let version = response.version;
    let live_headers = response.headers.clone();

    if v.no_cached_response() && status == StatusCode::NOT_MODIFIED {
        return ValidationStatus::DoNotTakeFromCache;
    }

    let cached = &v.cache.headers;
    let differs =
        |name: &HeaderName| header_str(&live_headers, name) != header_str(cached, name);

    if v.method == RequestMethod::Head {
        let mut invalidate = false;
        if v.live.entity_length.is_some() && v.live.entity_length != v.cache.info.entity_length {
            invalidate = true;
        }
        if differs(&CONTENT_MD5) || differs(&ETAG) {
            invalidate = true;
        }
        if status != StatusCode::NOT_MODIFIED && differs(&LAST_MODIFIED) {
            invalidate = true;
        }
        if invalidate {
            debug!("HEAD response shows the cached entity changed");
            return ValidationStatus::RemoveFromCache;
        }
    }

    if status == StatusCode::PARTIAL_CONTENT {
        // a server may omit Last-Modified when it validated by ETag
        if differs(&ETAG)
            || (differs(&LAST_MODIFIED)
                && (live_headers.contains_key(LAST_MODIFIED) || !live_headers.contains_key(ETAG)))
        {
            debug!("Partial response does not match the cached entity");
            return ValidationStatus::RemoveFromCache;
        }

        let Some(range) = v.live_range else {
            return ValidationStatus::DoNotTakeFromCache;
        };
        let size = v.stream_size();
        if size != range.start {
            return ValidationStatus::DoNotTakeFromCache;
        }

        replace_or_update_headers(v);
        v.cache.info.entity_length = v.live.entity_length;
        v.cache.version = version;
        if v.range_user {
            // the caller sees the combined stream from its own range start
            v.ctx.cache_stream_offset = size;
            v.ctx.cache_stream_length = Some(range.len());
            v.cache.status = Some(status);
        } else {
            v.ctx.cache_stream_offset = 0;
            v.ctx.cache_stream_length = v.live.entity_length;
            v.cache.status = Some(StatusCode::OK);
            v.cache.headers.remove(CONTENT_RANGE);
            match v.ctx.cache_stream_length {
                Some(length) => set_header(&mut v.cache.headers, CONTENT_LENGTH, &length.to_string()),
                None => {
                    v.cache.headers.remove(CONTENT_LENGTH);
                }
            }
        }
        return ValidationStatus::CombineCachedAndServerResponse;
    }

    if status == StatusCode::NOT_MODIFIED {
        let location_changed = live_headers.contains_key(CONTENT_LOCATION) && differs(&CONTENT_LOCATION);
        let etag_changed = live_headers.contains_key(ETAG) && differs(&ETAG);
        if v.cache.info.expires != v.live.expires
            || v.cache.info.last_modified != v.live.last_modified
            || v.cache.info.date != v.live.date
            || !v.live.cache_control.is_empty()
            || location_changed
            || etag_changed
        {
            replace_or_update_headers(v);
            return ValidationStatus::ReturnCachedResponse;
        }

        let ignored = REVALIDATION_ONLY
            .iter()
            .chain(&HOP_BY_HOP)
            .filter(|name| live_headers.contains_key(*name))
            .count();

        if live_headers.keys_len() <= ignored {
            v.dont_update_headers = true;
        } else {
            replace_or_update_headers(v);
        }
        return ValidationStatus::ReturnCachedResponse;
    }

    ValidationStatus::DoNotTakeFromCache
}

/// A live 5xx may be masked by a complete cached entry
pub(super) fn validate_on_5xx(v: &mut HttpValidator) -> ValidationStatus {
    if v.no_cached_response() {
        return ValidationStatus::DoNotTakeFromCache;
    }
    if v.cache.info.entity_length != Some(v.stream_size())
        || v.cache.status == Some(StatusCode::PARTIAL_CONTENT)
    {
        return ValidationStatus::DoNotTakeFromCache;
    }
    if validate_by_special_cases(v) != TriState::Valid {
        return ValidationStatus::DoNotTakeFromCache;
    }

    match v.level() {
        CacheLevel::CacheOnly | CacheLevel::CacheIfAvailable | CacheLevel::CacheOrNextCacheOnly => {
            ValidationStatus::ReturnCachedResponse
        }
        CacheLevel::Default | CacheLevel::Revalidate if validate_by_client_policy(v) => {
            append_header(&mut v.cache.headers, WARNING, WARNING_REVALIDATION_FAILED);
            ValidationStatus::ReturnCachedResponse
        }
        _ => ValidationStatus::DoNotTakeFromCache,
    }
}

/// `Unknown` without a stored Vary, `Invalid` on any mismatch
pub(super) fn validate_by_vary(v: &HttpValidator) -> TriState {
    if !v.cache.headers.contains_key(VARY) {
        return TriState::Unknown;
    }
    let vary = header_list(&v.cache.headers, VARY);
    if vary.first().is_none_or(|first| first.starts_with('*')) {
        return TriState::Invalid;
    }
    let Some(entry) = v.ctx.entry() else {
        return TriState::Invalid;
    };
    if entry.system_metadata.is_empty() {
        return TriState::Invalid;
    }

    let request_headers = v.ctx.request().map(|request| &request.headers);
    for name in &vary {
        let request_fields: Vec<String> = request_headers
            .map(|headers| header_list(headers, name.as_str()))
            .unwrap_or_default();
        let cached_fields = entry
            .system_metadata
            .get(&name.to_ascii_lowercase())
            .map(|value| split_list(value))
            .unwrap_or_default();

        if request_fields.len() != cached_fields.len()
            || request_fields
                .iter()
                .zip(&cached_fields)
                .any(|(request, cached)| !request.eq_ignore_ascii_case(cached))
        {
            return TriState::Invalid;
        }
    }
    TriState::Valid
}

/// Build a conditional (or ranged conditional) request for the entry
pub(super) fn try_conditional_request(v: &mut HttpValidator) -> ValidationStatus {
    match check_for_range_request(v) {
        (TriState::Invalid, _) => ValidationStatus::Continue,
        (TriState::Valid, _) => {
            if v.ftp_proxy {
                return ValidationStatus::DoNotTakeFromCache;
            }
            if try_conditional_range_request(v) {
                add_cache_range(v);
                return ValidationStatus::Continue;
            }
            ValidationStatus::DoNotTakeFromCache
        }
        (TriState::Unknown, _) => construct_conditional_request(v),
    }
}

/// Serve the entry, or the caller's range of it, when the bytes are held
pub(super) fn try_response_from_cache(v: &mut HttpValidator) -> ValidationStatus {
    let (is_range, ranges) = check_for_range_request(v);
    match is_range {
        TriState::Unknown => ValidationStatus::ReturnCachedResponse,
        TriState::Invalid => {
            let Some(spec) = ranges.as_deref().and_then(parse_range_request) else {
                return ValidationStatus::DoNotTakeFromCache;
            };
            let size = v.stream_size();
            let entity = v.cache.info.entity_length;
            let (start, end) = match spec {
                RangeSpec::From {
                    start,
                    end: Some(end),
                } => {
                    if start >= size || end >= size {
                        return ValidationStatus::Continue;
                    }
                    (start, end)
                }
                RangeSpec::From { start, end: None } => {
                    if start >= size || entity != Some(size) {
                        return ValidationStatus::Continue;
                    }
                    (start, size - 1)
                }
                RangeSpec::Suffix(length) => match entity {
                    Some(entity) if length > 0 && entity > 0 && entity <= size => {
                        (entity.saturating_sub(length), entity - 1)
                    }
                    _ => return ValidationStatus::Continue,
                },
            };
            v.ctx.cache_stream_offset = start;
            v.ctx.cache_stream_length = Some(end - start + 1);
            construct_206(v, start);
            ValidationStatus::ReturnCachedResponse
        }
        TriState::Valid => {
            let http_scheme = v
                .ctx
                .request()
                .is_some_and(|request| matches!(request.uri.scheme(), "http" | "https"));
            if v.level() == CacheLevel::CacheOnly && http_scheme {
                v.ctx.cache_stream_offset = 0;
                v.ctx.cache_stream_length = Some(v.stream_size());
                construct_206(v, 0);
                return ValidationStatus::ReturnCachedResponse;
            }
            if try_conditional_range_request(v) {
                add_cache_range(v);
            }
            ValidationStatus::Continue
        }
    }
}

/// `Invalid` for a caller range, `Valid` for a partial entry
fn check_for_range_request(v: &mut HttpValidator) -> (TriState, Option<String>) {
    if let Some(ranges) = v.request_header(RANGE).map(str::to_string) {
        v.range_user = true;
        return (TriState::Invalid, Some(ranges));
    }

    let size = v.stream_size();
    let entity = v.cache.info.entity_length;
    let partial_status = v.cache.status == Some(StatusCode::PARTIAL_CONTENT);
    if partial_status && entity == Some(size) {
        v.cache.status = Some(StatusCode::OK);
        v.cache.headers.remove(CONTENT_RANGE);
        set_header(&mut v.cache.headers, CONTENT_LENGTH, &size.to_string());
        return (TriState::Unknown, None);
    }

    let is_partial = v.ctx.entry().is_some_and(|entry| entry.is_partial);
    if is_partial || entity.is_some_and(|entity| entity != size) || partial_status {
        return (TriState::Valid, None);
    }
    (TriState::Unknown, None)
}

fn add_cache_range(v: &mut HttpValidator) {
    v.range_cache = true;
    let range = format!("bytes={}-", v.stream_size());
    v.edit_request(|headers| set_header(headers, RANGE, &range));
}

/// If-None-Match from the ETag and If-Modified-Since from the stored
/// Last-Modified; `DoNotTakeFromCache` when neither exists.
pub(super) fn construct_conditional_request(v: &mut HttpValidator) -> ValidationStatus {
    let mut result = ValidationStatus::DoNotTakeFromCache;

    let etag = header_str(&v.cache.headers, ETAG).map(str::to_string);
    if let Some(etag) = &etag {
        v.edit_request(|headers| set_header(headers, IF_NONE_MATCH, etag));
        v.if_header1 = Some(IF_NONE_MATCH);
        result = ValidationStatus::Continue;
    }

    if let Some(last_modified) = v.ctx.entry().and_then(|entry| entry.last_modified_at) {
        let value = format_http_date(last_modified);
        v.edit_request(|headers| set_header(headers, IF_MODIFIED_SINCE, &value));
        if etag.is_some() {
            v.if_header2 = Some(IF_MODIFIED_SINCE);
        } else {
            v.if_header1 = Some(IF_MODIFIED_SINCE);
        }
        result = ValidationStatus::Continue;
    }

    if result == ValidationStatus::DoNotTakeFromCache {
        debug!("Cannot construct a conditional request");
    }
    result
}

/// If-Range with the ETag, or with Last-Modified above HTTP/1.0
fn try_conditional_range_request(v: &mut HttpValidator) -> bool {
    let validator = if let Some(etag) = header_str(&v.cache.headers, ETAG) {
        etag.to_string()
    } else if let Some(last_modified) = v.ctx.entry().and_then(|entry| entry.last_modified_at) {
        if v.cache.version == Version::HTTP_10 {
            debug!("Conditional range requests are not attempted for HTTP/1.0 entries");
            return false;
        }
        format_http_date(last_modified)
    } else {
        return false;
    };

    v.edit_request(|headers| set_header(headers, IF_RANGE, &validator));
    v.if_header1 = Some(IF_RANGE);
    true
}

/// Present `cache_stream_length` bytes from `start` as a 206
pub(super) fn construct_206(v: &mut HttpValidator, start: u64) {
    let length = v.ctx.cache_stream_length.unwrap_or(0);
    let total = v.cache.info.entity_length.filter(|total| *total > 0);
    v.cache.status = Some(StatusCode::PARTIAL_CONTENT);
    set_header(
        &mut v.cache.headers,
        CONTENT_RANGE,
        &format_content_range(start, length, total),
    );
    set_header(&mut v.cache.headers, CONTENT_LENGTH, &length.to_string());
    if let Some(entry) = v.ctx.entry_mut() {
        entry.is_partial = true;
    }
}

pub(super) fn construct_200(v: &mut HttpValidator) {
    v.cache.status = Some(StatusCode::OK);
    v.cache.headers.remove(CONTENT_RANGE);
    match v.cache.info.entity_length {
        Some(length) => set_header(&mut v.cache.headers, CONTENT_LENGTH, &length.to_string()),
        None => {
            v.cache.headers.remove(CONTENT_LENGTH);
        }
    }
    if let Some(entry) = v.ctx.entry_mut() {
        entry.is_partial = false;
    }
}

/// Drop the cache's validators and ask every cache on the path to revalidate
pub(super) fn construct_unconditional_refresh(v: &mut HttpValidator) {
    v.edit_request(|headers| {
        set_header(headers, CACHE_CONTROL, "max-age=0");
        set_header(headers, PRAGMA, "no-cache");
    });
    remove_cache_conditionals(v);
}

/// Merge live headers into the cached block.
///
/// A 304 or 206 updates the stored headers in place; anything else replaces
/// them. Vary selected request values are saved in the entry's system
/// metadata. Hop-by-hop headers are never stored.
pub(super) fn replace_or_update_headers(v: &mut HttpValidator) {
    let Some(response) = v.ctx.response() else {
        return;
    };
    let status = response.status;
    let live_headers = response.headers.clone();

    if status != StatusCode::NOT_MODIFIED && status != StatusCode::PARTIAL_CONTENT {
        v.cache.headers = HeaderMap::new();
    }

    let vary = header_list(&live_headers, VARY);
    if vary.first().is_some_and(|first| !first.starts_with('*')) {
        let selected: Vec<(String, String)> = vary
            .iter()
            .map(|name| {
                let value = v
                    .ctx
                    .request()
                    .map(|request| {
                        request
                            .headers
                            .get_all(name.as_str())
                            .iter()
                            .filter_map(|value| value.to_str().ok())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                (name.to_ascii_lowercase(), value)
            })
            .collect();
        if let Some(entry) = v.ctx.entry_mut() {
            entry.system_metadata.extend(selected);
        }
    }

    for name in live_headers.keys() {
        if HOP_BY_HOP.contains(name) {
            continue;
        }
        if status == StatusCode::NOT_MODIFIED && name == CONTENT_LENGTH {
            continue;
        }
        v.cache.headers.remove(name);
        for value in live_headers.get_all(name) {
            v.cache.headers.append(name.clone(), value.clone());
        }
    }
}
