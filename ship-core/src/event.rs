//! Domain Event Types
//!
//! This module defines every event the backend pushes over the realtime
//! connection. Events arrive as a wire name (`"project:deleted"`) plus a JSON
//! payload; [`DomainEvent::decode`] turns that pair into a typed variant so
//! that dispatch is an exhaustive `match` instead of string comparison.
//!
//! Only the payload fields the client acts on are decoded. Everything else
//! the server sends is ignored.

use crate::error::EventDecodeError;
use crate::identity::{ProjectId, UserId};
use crate::message::MessageRecord;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;

/// Discriminant of a [`DomainEvent`], one per wire event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ProjectCreated,
    ProjectUpdated,
    ProjectDeleted,
    ProjectFeatured,
    VoteCast,
    VoteRemoved,
    CommentAdded,
    CommentUpdated,
    CommentDeleted,
    CommentVoted,
    LeaderboardUpdated,
    UserUpdated,
    BadgeAwarded,
    IntroReceived,
    IntroAccepted,
    IntroDeclined,
    MessageReceived,
    MessageRead,
    MessagesRead,
}

impl EventKind {
    /// Every event kind, in registration order.
    pub const ALL: [EventKind; 19] = [
        EventKind::ProjectCreated,
        EventKind::ProjectUpdated,
        EventKind::ProjectDeleted,
        EventKind::ProjectFeatured,
        EventKind::VoteCast,
        EventKind::VoteRemoved,
        EventKind::CommentAdded,
        EventKind::CommentUpdated,
        EventKind::CommentDeleted,
        EventKind::CommentVoted,
        EventKind::LeaderboardUpdated,
        EventKind::UserUpdated,
        EventKind::BadgeAwarded,
        EventKind::IntroReceived,
        EventKind::IntroAccepted,
        EventKind::IntroDeclined,
        EventKind::MessageReceived,
        EventKind::MessageRead,
        EventKind::MessagesRead,
    ];

    /// The wire name of this event.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ProjectCreated => "project:created",
            EventKind::ProjectUpdated => "project:updated",
            EventKind::ProjectDeleted => "project:deleted",
            EventKind::ProjectFeatured => "project:featured",
            EventKind::VoteCast => "vote:cast",
            EventKind::VoteRemoved => "vote:removed",
            EventKind::CommentAdded => "comment:added",
            EventKind::CommentUpdated => "comment:updated",
            EventKind::CommentDeleted => "comment:deleted",
            EventKind::CommentVoted => "comment:voted",
            EventKind::LeaderboardUpdated => "leaderboard:updated",
            EventKind::UserUpdated => "user:updated",
            EventKind::BadgeAwarded => "badge:awarded",
            EventKind::IntroReceived => "intro:received",
            EventKind::IntroAccepted => "intro:accepted",
            EventKind::IntroDeclined => "intro:declined",
            EventKind::MessageReceived => "message:received",
            EventKind::MessageRead => "message:read",
            EventKind::MessagesRead => "messages:read",
        }
    }

    /// Look up a kind by wire name.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed event pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    // ========================================================================
    // PROJECT EVENTS
    // ========================================================================
    /// A new project was published.
    ProjectCreated {
        /// Human-readable announcement, if the server included one
        message: Option<String>,
    },

    /// A project's details changed.
    ProjectUpdated { project_id: ProjectId },

    /// A project was deleted.
    ProjectDeleted { project_id: ProjectId },

    /// A project was featured by an admin.
    ProjectFeatured { project_id: ProjectId },

    // ========================================================================
    // VOTE EVENTS
    // ========================================================================
    /// Someone cast or changed a vote on a project.
    VoteCast { project_id: ProjectId },

    /// Someone removed their vote from a project.
    VoteRemoved { project_id: ProjectId },

    // ========================================================================
    // COMMENT EVENTS
    // ========================================================================
    CommentAdded { project_id: ProjectId },
    CommentUpdated { project_id: ProjectId },
    CommentDeleted { project_id: ProjectId },
    CommentVoted { project_id: ProjectId },

    // ========================================================================
    // RANKING, PROFILE AND BADGE EVENTS
    // ========================================================================
    /// Leaderboard standings were recomputed.
    LeaderboardUpdated,

    /// A user profile changed.
    UserUpdated { user_id: UserId },

    /// A validator awarded a badge to a project.
    BadgeAwarded { project_id: ProjectId },

    // ========================================================================
    // INTRO EVENTS
    // ========================================================================
    IntroReceived,
    IntroAccepted,
    IntroDeclined,

    // ========================================================================
    // MESSAGE EVENTS
    // ========================================================================
    /// A direct message arrived for the current user.
    MessageReceived {
        /// Who sent it, when known
        sender_id: Option<UserId>,
        /// Display name of the sender, when known
        sender_name: Option<String>,
        /// Message text, when included
        text: Option<String>,
    },

    /// One message was read by its recipient.
    MessageRead { sender_id: Option<UserId> },

    /// A batch of messages was read by their recipient.
    MessagesRead { sender_id: Option<UserId> },
}

#[derive(Deserialize)]
struct ProjectRef {
    project_id: ProjectId,
}

#[derive(Deserialize)]
struct UserRef {
    user_id: UserId,
}

#[derive(Default, Deserialize)]
struct Announcement {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Default, Deserialize)]
struct SenderRef {
    #[serde(default)]
    sender_id: Option<UserId>,
}

#[derive(Default, Deserialize)]
struct SenderInfo {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Default, Deserialize)]
struct ReceivedMessage {
    #[serde(default)]
    sender_id: Option<UserId>,
    #[serde(default)]
    sender: Option<SenderInfo>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Default, Deserialize)]
struct MessageReceivedPayload {
    #[serde(default)]
    data: Option<ReceivedMessage>,
    #[serde(default)]
    sender_id: Option<UserId>,
    #[serde(default)]
    sender_name: Option<String>,
}

fn parse<T: DeserializeOwned>(kind: EventKind, payload: &Value) -> Result<T, EventDecodeError> {
    // Events emitted without arguments arrive as null.
    let payload = match payload {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(payload).map_err(|e| EventDecodeError::MalformedPayload {
        name: kind.as_str().to_string(),
        reason: e.to_string(),
    })
}

impl DomainEvent {
    /// Decode a wire event into a typed event.
    pub fn decode(name: &str, payload: &Value) -> Result<Self, EventDecodeError> {
        let kind = EventKind::from_wire(name).ok_or_else(|| EventDecodeError::UnknownEvent {
            name: name.to_string(),
        })?;
        let project = |payload: &Value| parse::<ProjectRef>(kind, payload).map(|p| p.project_id);

        let event = match kind {
            EventKind::ProjectCreated => DomainEvent::ProjectCreated {
                message: parse::<Announcement>(kind, payload)?.message,
            },
            EventKind::ProjectUpdated => DomainEvent::ProjectUpdated {
                project_id: project(payload)?,
            },
            EventKind::ProjectDeleted => DomainEvent::ProjectDeleted {
                project_id: project(payload)?,
            },
            EventKind::ProjectFeatured => DomainEvent::ProjectFeatured {
                project_id: project(payload)?,
            },
            EventKind::VoteCast => DomainEvent::VoteCast {
                project_id: project(payload)?,
            },
            EventKind::VoteRemoved => DomainEvent::VoteRemoved {
                project_id: project(payload)?,
            },
            EventKind::CommentAdded => DomainEvent::CommentAdded {
                project_id: project(payload)?,
            },
            EventKind::CommentUpdated => DomainEvent::CommentUpdated {
                project_id: project(payload)?,
            },
            EventKind::CommentDeleted => DomainEvent::CommentDeleted {
                project_id: project(payload)?,
            },
            EventKind::CommentVoted => DomainEvent::CommentVoted {
                project_id: project(payload)?,
            },
            EventKind::LeaderboardUpdated => DomainEvent::LeaderboardUpdated,
            EventKind::UserUpdated => DomainEvent::UserUpdated {
                user_id: parse::<UserRef>(kind, payload)?.user_id,
            },
            EventKind::BadgeAwarded => DomainEvent::BadgeAwarded {
                project_id: project(payload)?,
            },
            EventKind::IntroReceived => DomainEvent::IntroReceived,
            EventKind::IntroAccepted => DomainEvent::IntroAccepted,
            EventKind::IntroDeclined => DomainEvent::IntroDeclined,
            EventKind::MessageReceived => {
                let raw = parse::<MessageReceivedPayload>(kind, payload)?;
                let data = raw.data.unwrap_or_default();
                DomainEvent::MessageReceived {
                    sender_id: data.sender_id.or(raw.sender_id),
                    sender_name: data.sender.and_then(|s| s.username).or(raw.sender_name),
                    text: data.message,
                }
            }
            EventKind::MessageRead => DomainEvent::MessageRead {
                sender_id: parse::<SenderRef>(kind, payload)?.sender_id,
            },
            EventKind::MessagesRead => DomainEvent::MessagesRead {
                sender_id: parse::<SenderRef>(kind, payload)?.sender_id,
            },
        };
        Ok(event)
    }

    /// Get the kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::ProjectCreated { .. } => EventKind::ProjectCreated,
            DomainEvent::ProjectUpdated { .. } => EventKind::ProjectUpdated,
            DomainEvent::ProjectDeleted { .. } => EventKind::ProjectDeleted,
            DomainEvent::ProjectFeatured { .. } => EventKind::ProjectFeatured,
            DomainEvent::VoteCast { .. } => EventKind::VoteCast,
            DomainEvent::VoteRemoved { .. } => EventKind::VoteRemoved,
            DomainEvent::CommentAdded { .. } => EventKind::CommentAdded,
            DomainEvent::CommentUpdated { .. } => EventKind::CommentUpdated,
            DomainEvent::CommentDeleted { .. } => EventKind::CommentDeleted,
            DomainEvent::CommentVoted { .. } => EventKind::CommentVoted,
            DomainEvent::LeaderboardUpdated => EventKind::LeaderboardUpdated,
            DomainEvent::UserUpdated { .. } => EventKind::UserUpdated,
            DomainEvent::BadgeAwarded { .. } => EventKind::BadgeAwarded,
            DomainEvent::IntroReceived => EventKind::IntroReceived,
            DomainEvent::IntroAccepted => EventKind::IntroAccepted,
            DomainEvent::IntroDeclined => EventKind::IntroDeclined,
            DomainEvent::MessageReceived { .. } => EventKind::MessageReceived,
            DomainEvent::MessageRead { .. } => EventKind::MessageRead,
            DomainEvent::MessagesRead { .. } => EventKind::MessagesRead,
        }
    }

    /// Preview text for a received message, at most 50 characters.
    pub fn message_snippet(&self) -> Option<String> {
        match self {
            DomainEvent::MessageReceived {
                text: Some(text), ..
            } if !text.is_empty() => Some(MessageRecord::snippet(text, 50)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_kind_round_trips_through_wire_name() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_decode_project_event() {
        let event = DomainEvent::decode("project:deleted", &json!({"project_id": "abc"})).unwrap();
        assert_eq!(
            event,
            DomainEvent::ProjectDeleted {
                project_id: ProjectId::new("abc")
            }
        );
        assert_eq!(event.kind(), EventKind::ProjectDeleted);
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let event = DomainEvent::decode(
            "vote:cast",
            &json!({"project_id": "abc", "vote_type": "up", "new_score": 4}),
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::VoteCast);
    }

    #[test]
    fn test_decode_empty_payloads() {
        assert_eq!(
            DomainEvent::decode("intro:received", &Value::Null).unwrap(),
            DomainEvent::IntroReceived
        );
        assert_eq!(
            DomainEvent::decode("project:created", &json!({})).unwrap(),
            DomainEvent::ProjectCreated { message: None }
        );
        assert_eq!(
            DomainEvent::decode("message:read", &json!({})).unwrap(),
            DomainEvent::MessageRead { sender_id: None }
        );
    }

    #[test]
    fn test_decode_missing_project_id_is_error() {
        let err = DomainEvent::decode("comment:added", &json!({})).unwrap_err();
        assert!(matches!(err, EventDecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn test_decode_unknown_event() {
        let err = DomainEvent::decode("project:archived", &json!({})).unwrap_err();
        assert_eq!(
            err,
            EventDecodeError::UnknownEvent {
                name: "project:archived".to_string()
            }
        );
    }

    #[test]
    fn test_decode_message_received_prefers_nested_data() {
        let event = DomainEvent::decode(
            "message:received",
            &json!({
                "type": "message_received",
                "recipient_id": "me",
                "sender_id": "outer",
                "sender_name": "fallback",
                "data": {
                    "sender_id": "u1",
                    "sender": {"username": "alice"},
                    "message": "gm"
                }
            }),
        )
        .unwrap();
        assert_eq!(
            event,
            DomainEvent::MessageReceived {
                sender_id: Some(UserId::new("u1")),
                sender_name: Some("alice".to_string()),
                text: Some("gm".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_message_received_falls_back_to_flat_fields() {
        let event = DomainEvent::decode(
            "message:received",
            &json!({"sender_id": "u7", "sender_name": "bob"}),
        )
        .unwrap();
        assert_eq!(
            event,
            DomainEvent::MessageReceived {
                sender_id: Some(UserId::new("u7")),
                sender_name: Some("bob".to_string()),
                text: None,
            }
        );
        assert_eq!(event.message_snippet(), None);
    }

    #[test]
    fn test_message_snippet_truncates() {
        let long = "x".repeat(80);
        let event = DomainEvent::MessageReceived {
            sender_id: None,
            sender_name: None,
            text: Some(long),
        };
        assert_eq!(event.message_snippet().unwrap().len(), 50);
    }
}
