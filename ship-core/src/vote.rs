//! Vote arithmetic.
//!
//! Voting uses toggle semantics: repeating the current direction clears the
//! vote, choosing the opposite direction flips it, and voting with no prior
//! vote sets it. [`VoteTally::apply`] computes the resulting local state
//! without touching the network so that it can be shown immediately.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteDirection {
    /// Contribution of one vote in this direction to the displayed count.
    pub fn weight(self) -> i64 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }

    /// Wire spelling used by `POST /votes`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the displayed vote state of one project looks like to one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteTally {
    pub vote_count: i64,
    pub user_vote: Option<VoteDirection>,
}

/// Kind of change a submission makes to the user's vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteChange {
    /// No prior vote; the vote is set.
    Set,
    /// Same direction as the prior vote; the vote is cleared.
    Cleared,
    /// Opposite direction; the vote is flipped.
    Flipped,
}

/// Before and after of one speculative vote submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTransition {
    pub before: VoteTally,
    pub after: VoteTally,
    pub change: VoteChange,
}

impl VoteTally {
    pub fn new(vote_count: i64, user_vote: Option<VoteDirection>) -> Self {
        Self {
            vote_count,
            user_vote,
        }
    }

    /// Apply a vote in `direction` with toggle semantics.
    pub fn apply(self, direction: VoteDirection) -> VoteTransition {
        let (after, change) = match self.user_vote {
            None => (
                Self::new(self.vote_count + direction.weight(), Some(direction)),
                VoteChange::Set,
            ),
            Some(current) if current == direction => (
                Self::new(self.vote_count - direction.weight(), None),
                VoteChange::Cleared,
            ),
            Some(_) => (
                Self::new(self.vote_count + 2 * direction.weight(), Some(direction)),
                VoteChange::Flipped,
            ),
        };
        VoteTransition {
            before: self,
            after,
            change,
        }
    }
}

/// Authoritative vote counts as reported by the server after a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCounts {
    #[serde(default)]
    pub upvotes: i64,
    #[serde(default)]
    pub downvotes: i64,
    #[serde(default)]
    pub user_vote: Option<VoteDirection>,
}

impl VoteCounts {
    pub fn net(&self) -> i64 {
        self.upvotes - self.downvotes
    }

    pub fn tally(&self) -> VoteTally {
        VoteTally::new(self.net(), self.user_vote)
    }
}
