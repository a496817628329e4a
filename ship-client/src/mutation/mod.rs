//! Optimistic mutation controllers.
//!
//! Each controller applies its speculative result to local state and the
//! cache before the network call, then reconciles: confirmed server state on
//! success, the stored snapshot on failure. Vote and save controllers accept
//! one submission at a time; a submission arriving while another is pending
//! is ignored.

pub mod message;
pub mod save;
pub mod vote;

pub use message::MessageSendController;
pub use save::SaveController;
pub use vote::{VoteController, VoteSnapshot};

use ship_cache::CacheError;
use ship_core::{PayloadError, ValidationError};

use crate::api_client::ApiClientError;

/// Failure before a submission reached the network.
#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Where a controller is in its submit cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutationPhase {
    #[default]
    Idle,
    Pending,
    Confirmed,
    RolledBack,
}

/// Snapshot and speculative value of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRecord<T> {
    pub previous: T,
    pub speculative: T,
    pub phase: MutationPhase,
}

impl<T: Clone> MutationRecord<T> {
    pub fn pending(previous: T, speculative: T) -> Self {
        Self {
            previous,
            speculative,
            phase: MutationPhase::Pending,
        }
    }

    /// Settle as confirmed and return the confirmed value.
    pub fn confirm(&mut self, confirmed: T) -> T {
        self.speculative = confirmed.clone();
        self.phase = MutationPhase::Confirmed;
        confirmed
    }

    /// Settle as rolled back and return the snapshot.
    pub fn roll_back(&mut self) -> T {
        self.phase = MutationPhase::RolledBack;
        self.previous.clone()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.phase, MutationPhase::Confirmed | MutationPhase::RolledBack)
    }
}

/// Result of one submission.
#[derive(Debug)]
pub enum SubmitOutcome<T> {
    /// Another submission was still pending; nothing was sent.
    Ignored,
    Confirmed(T),
    RolledBack { restored: T, error: ApiClientError },
}

impl<T> SubmitOutcome<T> {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored)
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }

    pub fn is_rolled_back(&self) -> bool {
        matches!(self, Self::RolledBack { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_confirm() {
        let mut record = MutationRecord::pending(10, 11);
        assert!(!record.is_settled());
        assert_eq!(record.confirm(12), 12);
        assert_eq!(record.phase, MutationPhase::Confirmed);
        assert_eq!(record.speculative, 12);
    }

    #[test]
    fn test_record_roll_back_returns_snapshot() {
        let mut record = MutationRecord::pending("before", "after");
        assert_eq!(record.roll_back(), "before");
        assert!(record.is_settled());
    }
}
