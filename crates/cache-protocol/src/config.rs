use std::time::Duration;

use crate::validator::DEFAULT_UNSPECIFIED_MAX_AGE;

/// Configurable options for the protocol engine
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Fail the request on storage errors instead of logging them and
    /// continuing without the cache
    pub strict_cache_errors: bool,

    /// Freshness lifetime of responses carrying no expiration information
    pub unspecified_max_age: Duration,

    /// How many times a validator may ask for a fresh lookup in one request
    pub max_cache_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            strict_cache_errors: false,
            unspecified_max_age: DEFAULT_UNSPECIFIED_MAX_AGE,
            max_cache_retries: 3,
        }
    }
}

impl ProtocolConfig {
    pub fn builder() -> crate::builder::ProtocolConfigBuilder {
        crate::builder::ProtocolConfigBuilder::new()
    }
}
