use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cache::{CacheEntry, CacheKey};
use crate::message::{CacheRequest, CacheResponse};

use super::{FreshnessStatus, ValidationStatus};

/// Freshness lifetime used when a response carries no expiration information
pub const DEFAULT_UNSPECIFIED_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether a cache stream is held for the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStreamState {
    /// No lookup happened yet
    #[default]
    NotLookedUp,
    /// Lookup found nothing, or the stream was released
    NoEntry,
    Present,
}

/// Mutable state of one logical request, shared by every validator phase.
///
/// Reset by `begin` for a new request; `begin_retry` keeps the response count.
#[derive(Debug, Clone)]
pub struct ValidatorContext {
    key: Option<CacheKey>,
    request: Option<CacheRequest>,
    response: Option<CacheResponse>,
    response_count: u32,
    entry: Option<CacheEntry>,
    stream_state: CacheStreamState,
    pub(crate) cache_stream_offset: u64,
    pub(crate) cache_stream_length: Option<u64>,
    pub(crate) validation_status: ValidationStatus,
    pub(crate) freshness_status: FreshnessStatus,
    /// Declared length passed to the storage backend on store
    pub(crate) store_content_length: Option<u64>,
    /// Update only timestamps, not the stored header block
    pub(crate) keep_stored_headers: bool,
    unspecified_max_age: Duration,
    clock: Option<DateTime<Utc>>,
}

impl Default for ValidatorContext {
    fn default() -> Self {
        Self {
            key: None,
            request: None,
            response: None,
            response_count: 0,
            entry: None,
            stream_state: CacheStreamState::NotLookedUp,
            cache_stream_offset: 0,
            cache_stream_length: None,
            validation_status: ValidationStatus::Continue,
            freshness_status: FreshnessStatus::Undefined,
            store_content_length: None,
            keep_stored_headers: false,
            unspecified_max_age: DEFAULT_UNSPECIFIED_MAX_AGE,
            clock: None,
        }
    }
}

impl ValidatorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&mut self, key: CacheKey, request: CacheRequest) {
        let unspecified_max_age = self.unspecified_max_age;
        let clock = self.clock;
        *self = Self {
            key: Some(key),
            request: Some(request),
            unspecified_max_age,
            clock,
            ..Default::default()
        };
    }

    pub(crate) fn begin_retry(&mut self, request: CacheRequest) {
        self.request = Some(request);
        self.response = None;
        self.entry = None;
        self.stream_state = CacheStreamState::NotLookedUp;
        self.cache_stream_offset = 0;
        self.cache_stream_length = None;
        self.validation_status = ValidationStatus::Continue;
        self.freshness_status = FreshnessStatus::Undefined;
        self.store_content_length = None;
        self.keep_stored_headers = false;
    }

    pub(crate) fn set_entry(&mut self, entry: Option<CacheEntry>, is_private: bool) {
        self.stream_state = if entry.is_some() {
            CacheStreamState::Present
        } else {
            CacheStreamState::NoEntry
        };
        self.entry = Some(entry.unwrap_or_else(|| CacheEntry::new(is_private)));
        self.cache_stream_offset = 0;
        self.cache_stream_length = None;
    }

    pub(crate) fn set_response(&mut self, response: CacheResponse) {
        self.response = Some(response);
        self.response_count += 1;
    }

    /// Mark the cache stream as no longer held
    pub(crate) fn release_stream(&mut self) {
        if self.stream_state == CacheStreamState::Present {
            self.stream_state = CacheStreamState::NoEntry;
        }
    }

    /// Pin the clock used for age arithmetic
    pub fn set_now(&mut self, now: DateTime<Utc>) {
        self.clock = Some(now);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    pub fn set_unspecified_max_age(&mut self, max_age: Duration) {
        self.unspecified_max_age = max_age;
    }

    pub fn unspecified_max_age(&self) -> Duration {
        self.unspecified_max_age
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    /// Point the lookup at another key, used before `RetryResponseFromCache`
    pub fn set_key(&mut self, key: CacheKey) {
        self.key = Some(key);
    }

    pub fn request(&self) -> Option<&CacheRequest> {
        self.request.as_ref()
    }

    pub fn request_mut(&mut self) -> Option<&mut CacheRequest> {
        self.request.as_mut()
    }

    pub fn response(&self) -> Option<&CacheResponse> {
        self.response.as_ref()
    }

    pub fn response_count(&self) -> u32 {
        self.response_count
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        self.entry.as_ref()
    }

    pub fn entry_mut(&mut self) -> Option<&mut CacheEntry> {
        self.entry.as_mut()
    }

    pub fn stream_state(&self) -> CacheStreamState {
        self.stream_state
    }

    pub fn has_cache_stream(&self) -> bool {
        self.stream_state == CacheStreamState::Present
    }

    /// First byte of the entry served to the caller
    pub fn cache_stream_offset(&self) -> u64 {
        self.cache_stream_offset
    }

    /// Number of entry bytes served, `None` for everything after the offset
    pub fn cache_stream_length(&self) -> Option<u64> {
        self.cache_stream_length
    }

    pub fn validation_status(&self) -> ValidationStatus {
        self.validation_status
    }

    pub fn freshness_status(&self) -> FreshnessStatus {
        self.freshness_status
    }

    pub fn store_content_length(&self) -> Option<u64> {
        self.store_content_length
    }

    pub fn keep_stored_headers(&self) -> bool {
        self.keep_stored_headers
    }
}
