use std::error::Error as StdError;

use crate::validator::{Phase, ValidationStatus};

/// Errors surfaced by the cache protocol engine and its validators.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A cache-only policy was requested but no usable entry exists.
    #[error("Cache entry not found and the cache policy forbids network access")]
    EntryNotFound,

    /// The request must reach the network but the cache policy prohibits it.
    #[error("Request prohibited by cache policy")]
    ProhibitedByPolicy,

    #[error("Validator returned unexpected status {status} during {phase}")]
    UnexpectedStatus {
        phase: Phase,
        status: ValidationStatus,
    },

    #[error("Validator failed during {phase}: {reason}")]
    ValidatorFailed { phase: Phase, reason: String },

    #[error("Outcome {0} requires a cache stream but none is held")]
    NoCacheStream(ValidationStatus),

    #[error("Cache storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Transport(Box<dyn StdError + Send + Sync>),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CacheError {
    /// Whether the error came from a cache policy conflict rather than I/O.
    pub fn is_policy_conflict(&self) -> bool {
        matches!(self, Self::EntryNotFound | Self::ProhibitedByPolicy)
    }
}
