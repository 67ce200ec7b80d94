//! # Builder for ProtocolConfig
//!
//! Fluent construction of [`ProtocolConfig`] instances.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use cache_protocol::ProtocolConfig;
//!
//! let config = ProtocolConfig::builder()
//!     .with_strict_cache_errors(true)
//!     .with_unspecified_max_age(Duration::from_secs(3600))
//!     .build();
//! assert!(config.strict_cache_errors);
//! ```

use std::time::Duration;

use crate::ProtocolConfig;

/// Builder for creating ProtocolConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct ProtocolConfigBuilder {
    config: ProtocolConfig,
}

impl ProtocolConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: ProtocolConfig::default(),
        }
    }

    /// Propagate storage errors instead of degrading to uncached operation
    pub fn with_strict_cache_errors(mut self, strict: bool) -> Self {
        self.config.strict_cache_errors = strict;
        self
    }

    /// Set the freshness lifetime used when a response does not declare one
    pub fn with_unspecified_max_age(mut self, max_age: Duration) -> Self {
        self.config.unspecified_max_age = max_age;
        self
    }

    /// Bound the number of repeated cache lookups per request
    pub fn with_max_cache_retries(mut self, retries: u32) -> Self {
        self.config.max_cache_retries = retries;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ProtocolConfig {
        self.config
    }
}

impl Default for ProtocolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ProtocolConfigBuilder::new().build();
        assert!(!config.strict_cache_errors);
        assert_eq!(config.unspecified_max_age, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.max_cache_retries, 3);
    }

    #[test]
    fn test_builder_overrides() {
        let config = ProtocolConfig::builder()
            .with_strict_cache_errors(true)
            .with_unspecified_max_age(Duration::from_secs(60))
            .with_max_cache_retries(0)
            .build();
        assert!(config.strict_cache_errors);
        assert_eq!(config.unspecified_max_age, Duration::from_secs(60));
        assert_eq!(config.max_cache_retries, 0);
    }
}
