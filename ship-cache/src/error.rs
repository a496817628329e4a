//! Error types for the query cache.

use ship_core::QueryKey;
use thiserror::Error;

/// Error reported by a [`crate::QueryFetcher`].
///
/// Fetchers live in other crates with their own error types; the cache only
/// keeps the rendered reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct FetchError {
    pub reason: String,
}

impl FetchError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The fetcher has no route for this key.
    pub fn unroutable(key: &QueryKey) -> Self {
        Self::new(format!("no query is defined for key {}", key))
    }
}

/// Cache errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("Cache lock poisoned")]
    LockPoisoned,

    #[error("Fetch failed for {key}: {reason}")]
    Fetch { key: QueryKey, reason: String },

    #[error("No fetcher installed; cannot load {key}")]
    NoFetcher { key: QueryKey },

    #[error("Cached value for {key} has unexpected shape: {reason}")]
    Decode { key: QueryKey, reason: String },
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
