//! Per-request cache policy.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// How a request may use the cache.
///
/// FTP treats `Refresh` like `Reload` and `CacheOrNextCacheOnly` like `CacheOnly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheLevel {
    /// Serve from cache subject to freshness and the age settings of the policy
    #[default]
    Default,
    /// Never look at or update the cache
    BypassCache,
    /// Serve from cache only, never touch the network
    CacheOnly,
    /// Serve any cached entry, go to the network otherwise
    CacheIfAvailable,
    /// Always revalidate with the origin
    Revalidate,
    /// Fetch from the origin and cache the result
    Reload,
    /// Fetch from the origin, keep nothing
    NoCacheNoStore,
    /// Serve from this cache or the next cache on the path
    CacheOrNextCacheOnly,
    /// Force intermediaries to revalidate
    Refresh,
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::str::FromStr for CacheLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "default" => Self::Default,
            "bypasscache" | "bypass" => Self::BypassCache,
            "cacheonly" => Self::CacheOnly,
            "cacheifavailable" => Self::CacheIfAvailable,
            "revalidate" => Self::Revalidate,
            "reload" => Self::Reload,
            "nocachenostore" => Self::NoCacheNoStore,
            "cacheornextcacheonly" => Self::CacheOrNextCacheOnly,
            "refresh" => Self::Refresh,
            other => return Err(format!("unknown cache level: {other}")),
        };
        Ok(level)
    }
}

/// Cache level plus the client age limits applied at `CacheLevel::Default`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachePolicy {
    pub level: CacheLevel,
    /// Oldest acceptable entry
    pub max_age: Option<Duration>,
    /// Entry must stay fresh for at least this long
    pub min_fresh: Option<Duration>,
    /// Accept entries stale by up to this long
    pub max_stale: Option<Duration>,
    /// Entries synchronized before this instant are unacceptable
    pub cache_sync_date: Option<DateTime<Utc>>,
}

impl CachePolicy {
    pub fn new(level: CacheLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_min_fresh(mut self, min_fresh: Duration) -> Self {
        self.min_fresh = Some(min_fresh).filter(|d| !d.is_zero());
        self
    }

    pub fn with_max_stale(mut self, max_stale: Duration) -> Self {
        self.max_stale = Some(max_stale).filter(|d| !d.is_zero());
        self
    }

    pub fn with_cache_sync_date(mut self, date: DateTime<Utc>) -> Self {
        self.cache_sync_date = Some(date);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_levels_loosely() {
        assert_eq!("cache-only".parse::<CacheLevel>(), Ok(CacheLevel::CacheOnly));
        assert_eq!(
            "NoCacheNoStore".parse::<CacheLevel>(),
            Ok(CacheLevel::NoCacheNoStore)
        );
        assert!("sometimes".parse::<CacheLevel>().is_err());
    }

    #[test]
    fn zero_staleness_means_unset() {
        let policy = CachePolicy::new(CacheLevel::Default)
            .with_min_fresh(Duration::ZERO)
            .with_max_stale(Duration::from_secs(5));
        assert_eq!(policy.min_fresh, None);
        assert_eq!(policy.max_stale, Some(Duration::from_secs(5)));
    }
}
