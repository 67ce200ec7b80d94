//! # Validators
//!
//! The per-request state machine deciding whether a cached response may be
//! served, must be revalidated, combined with live bytes, stored or evicted.
//!
//! Phases run in this order for one logical request:
//!
//! 1. [`CacheValidator::validate_request`]
//! 2. cache lookup (performed by the protocol engine)
//! 3. [`CacheValidator::validate_freshness`]
//! 4. [`CacheValidator::validate_cache`]
//! 5. live request, unless the cached response is returned
//! 6. [`CacheValidator::validate_response`]
//! 7. [`CacheValidator::revalidate_cache`]
//! 8. [`CacheValidator::update_cache`]

use std::fmt;

use crate::cache::{CacheEntry, CacheKey};
use crate::error::CacheError;
use crate::message::{CacheRequest, CacheResponse};

mod cache_control;
mod context;
mod ftp;
pub(crate) mod headers;
mod http;
mod rfc2616;

pub use cache_control::CacheControl;
pub use context::{CacheStreamState, DEFAULT_UNSPECIFIED_MAX_AGE, ValidatorContext};
pub use ftp::FtpValidator;
pub use http::HttpValidator;

/// Outcome of a validator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValidationStatus {
    /// Proceed to the next phase, or send the request as it stands
    #[default]
    Continue,
    /// Ignore the cache for this request and do not cache the response
    DoNotUseCache,
    /// Do not serve the cache; the response may still be cached
    DoNotTakeFromCache,
    /// Redo the cache lookup, the key changed
    RetryResponseFromCache,
    /// Drop the live response and resend the corrected request
    RetryResponseFromServer,
    ReturnCachedResponse,
    CombineCachedAndServerResponse,
    CacheResponse,
    UpdateResponseInformation,
    RemoveFromCache,
    DoNotUpdateCache,
    /// The caller must raise a protocol error
    Fail,
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Freshness of a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FreshnessStatus {
    Fresh,
    Stale,
    #[default]
    Undefined,
}

/// Validator phase, used in diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    ValidateRequest,
    ValidateFreshness,
    ValidateCache,
    ValidateResponse,
    RevalidateCache,
    UpdateCache,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ValidateRequest => "ValidateRequest",
            Self::ValidateFreshness => "ValidateFreshness",
            Self::ValidateCache => "ValidateCache",
            Self::ValidateResponse => "ValidateResponse",
            Self::RevalidateCache => "RevalidateCache",
            Self::UpdateCache => "UpdateCache",
        };
        f.write_str(name)
    }
}

/// A cache validation state machine for one protocol.
///
/// A phase signals a terminal policy conflict by returning
/// `Err(CacheError::EntryNotFound)` or `Err(CacheError::ProhibitedByPolicy)`.
pub trait CacheValidator: Send {
    fn context(&self) -> &ValidatorContext;

    fn context_mut(&mut self) -> &mut ValidatorContext;

    /// Decide whether the request may use the cache at all
    fn validate_request(&mut self) -> Result<ValidationStatus, CacheError>;

    /// Compute the freshness of the looked-up entry
    fn validate_freshness(&mut self) -> FreshnessStatus;

    /// First decision point, before any live request
    fn validate_cache(&mut self) -> Result<ValidationStatus, CacheError>;

    /// Check the live response for inconsistencies needing a retry
    fn validate_response(&mut self) -> Result<ValidationStatus, CacheError>;

    /// Second decision point, after seeing the live response
    fn revalidate_cache(&mut self) -> Result<ValidationStatus, CacheError>;

    /// Decide what to persist from the live response
    fn update_cache(&mut self) -> Result<ValidationStatus, CacheError>;

    /// Response describing the cached bytes the engine serves
    fn cached_response(&self) -> Option<CacheResponse>;

    /// Clear protocol-specific state between requests and retries
    fn clear_state(&mut self) {}

    /// Start a new logical request
    fn fetch_request(&mut self, key: CacheKey, request: CacheRequest) {
        self.clear_state();
        self.context_mut().begin(key, request);
    }

    /// Resend within the same logical request, keeping the response count
    fn fetch_retry(&mut self, request: CacheRequest) {
        self.clear_state();
        self.context_mut().begin_retry(request);
    }

    /// Record the looked-up entry, `None` when nothing is stored
    fn fetch_cache_entry(&mut self, entry: Option<CacheEntry>, is_private: bool) {
        self.context_mut().set_entry(entry, is_private);
    }

    /// Record a delivered live response
    fn set_response(&mut self, response: CacheResponse) {
        self.context_mut().set_response(response);
    }
}
