//! The seam between the cache and whatever loads data for a key.

use async_trait::async_trait;
use serde_json::Value;
use ship_core::QueryKey;
use std::sync::Arc;

use crate::error::FetchError;

/// Loads the authoritative value for a cache key.
///
/// Implementations must be safe to call concurrently for different keys.
/// The cache guarantees at most one call in flight per key.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError>;
}

#[async_trait]
impl<F: QueryFetcher + ?Sized> QueryFetcher for Arc<F> {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError> {
        (**self).fetch(key).await
    }
}
