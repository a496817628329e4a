//! Hierarchical cache keys.
//!
//! A [`QueryKey`] is an ordered list of segments. Keys form a prefix
//! hierarchy: an operation on `["projects"]` applies to every key that
//! begins with that segment, such as `["projects", "hot", 1]`.
//!
//! Keys are only built through the [`keys`] taxonomy so that the cache,
//! the synchronization controller and the mutation controllers agree on
//! spelling.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Int(i64),
    Str(String),
}

impl KeySegment {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Str(_) => None,
        }
    }
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for KeySegment {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<u32> for KeySegment {
    fn from(i: u32) -> Self {
        Self::Int(i64::from(i))
    }
}

/// Identifier of one cached query result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey {
    segments: Vec<KeySegment>,
}

impl QueryKey {
    pub fn new(segments: Vec<KeySegment>) -> Self {
        Self { segments }
    }

    /// Build a single-segment key.
    pub fn root(segment: impl Into<KeySegment>) -> Self {
        Self {
            segments: vec![segment.into()],
        }
    }

    /// Append a segment, builder style.
    pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&KeySegment> {
        self.segments.get(index)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The first segment as a string, when it is one.
    pub fn head(&self) -> Option<&str> {
        self.segments.first().and_then(KeySegment::as_str)
    }

    /// True if `prefix` matches the leading segments of this key.
    ///
    /// Every key starts with itself and with the empty key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", segment)?;
        }
        f.write_str("]")
    }
}

impl<S: Into<KeySegment>> FromIterator<S> for QueryKey {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(Into::into).collect())
    }
}

/// The key taxonomy used across the application.
pub mod keys {
    use super::QueryKey;
    use crate::identity::{ProjectId, UserId};

    pub const PROJECTS: &str = "projects";
    pub const PROJECT: &str = "project";
    pub const COMMENTS: &str = "comments";
    pub const BADGES: &str = "badges";
    pub const LEADERBOARD: &str = "leaderboard";
    pub const USER: &str = "user";
    pub const INTROS: &str = "intros";
    pub const MESSAGES: &str = "messages";
    pub const SAVED_PROJECTS: &str = "saved-projects";
    pub const SAVED_CHECK: &str = "saved-check";

    /// Every feed page.
    pub fn projects() -> QueryKey {
        QueryKey::root(PROJECTS)
    }

    /// One feed page, e.g. `["projects", "hot", 1]`.
    pub fn feed(sort: &str, page: u32) -> QueryKey {
        projects().with(sort).with(page)
    }

    pub fn project(id: &ProjectId) -> QueryKey {
        QueryKey::root(PROJECT).with(id.as_str())
    }

    pub fn comments(project_id: &ProjectId) -> QueryKey {
        QueryKey::root(COMMENTS).with(project_id.as_str())
    }

    pub fn badges(project_id: &ProjectId) -> QueryKey {
        QueryKey::root(BADGES).with(project_id.as_str())
    }

    pub fn leaderboard() -> QueryKey {
        QueryKey::root(LEADERBOARD)
    }

    pub fn leaderboard_projects(limit: u32) -> QueryKey {
        leaderboard().with("projects").with(limit)
    }

    pub fn leaderboard_builders(limit: u32) -> QueryKey {
        leaderboard().with("builders").with(limit)
    }

    pub fn user(user_id: &UserId) -> QueryKey {
        QueryKey::root(USER).with(user_id.as_str())
    }

    pub fn intros_received() -> QueryKey {
        QueryKey::root(INTROS).with("received")
    }

    pub fn intros_sent() -> QueryKey {
        QueryKey::root(INTROS).with("sent")
    }

    /// Every message query: conversation list and individual threads.
    pub fn messages() -> QueryKey {
        QueryKey::root(MESSAGES)
    }

    pub fn conversations() -> QueryKey {
        messages().with("conversations")
    }

    pub fn conversation(user_id: &UserId) -> QueryKey {
        messages().with("conversation").with(user_id.as_str())
    }

    pub fn saved_projects() -> QueryKey {
        QueryKey::root(SAVED_PROJECTS)
    }

    pub fn saved_projects_page(page: u32, per_page: u32) -> QueryKey {
        saved_projects().with(page).with(per_page)
    }

    pub fn saved_check(project_id: &ProjectId) -> QueryKey {
        QueryKey::root(SAVED_CHECK).with(project_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ProjectId, UserId};
    use proptest::prelude::*;

    #[test]
    fn test_prefix_hierarchy() {
        let page = keys::feed("hot", 1);
        assert!(page.starts_with(&keys::projects()));
        assert!(!keys::projects().starts_with(&page));
        assert!(!keys::project(&ProjectId::new("abc")).starts_with(&keys::projects()));
    }

    #[test]
    fn test_conversation_under_messages() {
        let thread = keys::conversation(&UserId::new("u1"));
        assert!(thread.starts_with(&keys::messages()));
        assert!(!thread.starts_with(&keys::conversations()));
        assert!(keys::conversations().starts_with(&keys::messages()));
    }

    #[test]
    fn test_display() {
        assert_eq!(keys::feed("new", 2).to_string(), "[\"projects\",\"new\",2]");
        assert_eq!(
            keys::project(&ProjectId::new("abc")).to_string(),
            "[\"project\",\"abc\"]"
        );
    }

    #[test]
    fn test_serde_round_trip_keeps_segment_types() {
        let key = keys::leaderboard_projects(50);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "[\"leaderboard\",\"projects\",50]");
        let back: QueryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    fn segment() -> impl Strategy<Value = KeySegment> {
        prop_oneof![
            any::<i64>().prop_map(KeySegment::Int),
            "[a-z]{1,8}".prop_map(KeySegment::Str),
        ]
    }

    proptest! {
        #[test]
        fn prop_every_prefix_matches(segments in prop::collection::vec(segment(), 0..6), cut in 0usize..6) {
            let key = QueryKey::new(segments.clone());
            let cut = cut.min(segments.len());
            let prefix = QueryKey::new(segments[..cut].to_vec());
            prop_assert!(key.starts_with(&prefix));
            prop_assert!(key.starts_with(&key));
        }

        #[test]
        fn prop_longer_key_is_never_prefix(segments in prop::collection::vec(segment(), 0..6), extra in segment()) {
            let key = QueryKey::new(segments.clone());
            let longer = key.clone().with(extra);
            prop_assert!(!key.starts_with(&longer));
        }
    }
}
