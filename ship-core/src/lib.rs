//! 0x.ship Core - Shared Types
//!
//! Pure data structures shared by the cache, the realtime client and the
//! optimistic mutation controllers. This crate performs no I/O.

pub mod envelope;
pub mod error;
pub mod event;
pub mod identity;
pub mod key;
pub mod message;
pub mod project;
pub mod vote;

pub use envelope::{ApiEnvelope, EnvelopeStatus};
pub use error::{EventDecodeError, PayloadError, ShipError, ShipResult, ValidationError};
pub use event::{DomainEvent, EventKind};
pub use identity::{new_local_id, MessageId, ProjectId, Timestamp, UserId};
pub use key::{keys, KeySegment, QueryKey};
pub use message::{DeliveryStatus, MessageRecord};
pub use project::{normalize_project, patch_vote_tally, read_vote_tally};
pub use vote::{VoteChange, VoteCounts, VoteDirection, VoteTally, VoteTransition};
