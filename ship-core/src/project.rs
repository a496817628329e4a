//! Project payload helpers.
//!
//! Project details are cached as the backend's JSON object, extended with
//! the two display fields the vote controller reads and patches:
//! `voteCount` (upvotes minus downvotes) and `userVote`.

use crate::error::PayloadError;
use crate::vote::{VoteDirection, VoteTally};
use serde_json::{Map, Value};

const VOTE_COUNT: &str = "voteCount";
const USER_VOTE: &str = "userVote";

/// Add `voteCount` and `userVote` to a backend project object.
///
/// Non-object values are returned unchanged. Existing display fields are
/// overwritten when the raw counts are present.
pub fn normalize_project(mut project: Value) -> Value {
    if let Value::Object(map) = &mut project {
        let upvotes = map.get("upvotes").and_then(Value::as_i64);
        let downvotes = map.get("downvotes").and_then(Value::as_i64);
        if upvotes.is_some() || downvotes.is_some() {
            let net = upvotes.unwrap_or(0) - downvotes.unwrap_or(0);
            map.insert(VOTE_COUNT.to_string(), Value::from(net));
        }
        if let Some(user_vote) = map.get("user_vote").cloned() {
            map.insert(USER_VOTE.to_string(), user_vote);
        }
    }
    project
}

/// Read the displayed tally from a cached project object.
pub fn read_vote_tally(project: &Value) -> Option<VoteTally> {
    let map = project.as_object()?;
    let vote_count = map.get(VOTE_COUNT).and_then(Value::as_i64)?;
    let user_vote = match map.get(USER_VOTE) {
        None | Some(Value::Null) => None,
        Some(v) => Some(serde_json::from_value::<VoteDirection>(v.clone()).ok()?),
    };
    Some(VoteTally::new(vote_count, user_vote))
}

/// Overwrite the displayed tally of a cached project object.
pub fn patch_vote_tally(project: &mut Value, tally: VoteTally) -> Result<(), PayloadError> {
    let map: &mut Map<String, Value> =
        project.as_object_mut().ok_or_else(|| PayloadError::NotAnObject {
            what: "project".to_string(),
        })?;
    map.insert(VOTE_COUNT.to_string(), Value::from(tally.vote_count));
    let user_vote = match tally.user_vote {
        Some(direction) => Value::from(direction.as_str()),
        None => Value::Null,
    };
    map.insert(USER_VOTE.to_string(), user_vote.clone());
    map.insert("user_vote".to_string(), user_vote);
    Ok(())
}
