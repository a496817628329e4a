//! 0x.ship Cache - Keyed Query Cache
//!
//! Holds the client-side copy of server data, addressed by hierarchical
//! [`QueryKey`](ship_core::QueryKey)s. The synchronization controller
//! invalidates and evicts entries in response to pushed events; the
//! optimistic mutation controllers patch entries directly; everything else
//! only reads.

pub mod cache;
pub mod entry;
pub mod error;
pub mod fetcher;

pub use cache::{CacheChange, CacheConfig, CacheStats, QueryCache, QueryObserver};
pub use entry::{CacheEntry, EntryStatus};
pub use error::{CacheError, CacheResult, FetchError};
pub use fetcher::QueryFetcher;
