//! Top-level error type for the sync client.

use crate::api_client::ApiClientError;
use crate::config::ConfigError;
use crate::mutation::MutationError;
use crate::persistence::PersistenceError;
use crate::realtime::RealtimeError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiClientError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Cache(#[from] ship_cache::CacheError),
    #[error("Logging setup failed: {0}")]
    Logging(String),
}
