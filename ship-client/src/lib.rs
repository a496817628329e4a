//! 0x.ship sync client.
//!
//! Keeps a local [`QueryCache`](ship_cache::QueryCache) consistent with the
//! backend: REST fetches fill it, Socket.IO domain events invalidate and
//! evict it, and the optimistic mutation controllers patch it ahead of
//! server confirmation.

pub mod api_client;
pub mod app;
pub mod config;
pub mod error;
pub mod mutation;
pub mod notifications;
pub mod persistence;
pub mod prefetch;
pub mod realtime;
pub mod routes;
pub mod socketio;
pub mod sync;

pub use app::{Backends, ShipClient, StartReport};
pub use config::ShipConfig;
pub use error::ClientError;
pub use realtime::{ConnectionHandle, RealtimeService};
