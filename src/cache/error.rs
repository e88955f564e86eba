//! Error taxonomy shared by every cache component.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the cache engine.
///
/// The type is `Clone` so that a single loader outcome can be handed to every
/// caller waiting on the same key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Nothing cached and nothing loadable. A normal outcome, not a fault.
    #[error("cache entry not found")]
    NotFound,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: String,
        after: Duration,
    },
    #[error("operation forbidden: {0}")]
    Forbidden(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("{tier} tier failure: {message}")]
    Tier { tier: &'static str, message: String },
    #[error("loader failed: {0}")]
    Loader(String),
    #[error("manifest error: {0}")]
    Manifest(String),
}

impl CacheError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn tier(tier: &'static str, message: impl Into<String>) -> Self {
        Self::Tier {
            tier,
            message: message.into(),
        }
    }

    pub fn loader(err: impl std::fmt::Display) -> Self {
        Self::Loader(err.to_string())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable(message.into())
    }

    /// True for outcomes that should fall through to the next tier or region.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Tier { .. })
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
