//! Direct message records as held in a cached conversation.

use crate::identity::{MessageId, UserId};
use serde::{Deserialize, Serialize};

/// Delivery state of a message in the local conversation list.
///
/// Server-delivered records carry no status field and are always `Sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Sending,
    #[default]
    Sent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    #[serde(default)]
    pub sender_id: Option<UserId>,
    pub recipient_id: UserId,
    pub message: String,
    #[serde(default)]
    pub is_read: bool,
    /// Kept verbatim; the backend emits naive ISO-8601 timestamps.
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub status: DeliveryStatus,
}

impl MessageRecord {
    /// A record for a message the server has not yet acknowledged.
    pub fn provisional(recipient_id: UserId, message: impl Into<String>) -> Self {
        Self {
            id: MessageId::local(),
            sender_id: None,
            recipient_id,
            message: message.into(),
            is_read: false,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
            status: DeliveryStatus::Sending,
        }
    }

    /// First `max_chars` characters, for notification previews.
    pub fn snippet(text: &str, max_chars: usize) -> String {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_record() {
        let record = MessageRecord::provisional(UserId::new("u2"), "gm");
        assert_eq!(record.status, DeliveryStatus::Sending);
        assert!(record.id.is_local());
    }

    #[test]
    fn test_server_record_defaults_to_sent() {
        let record: MessageRecord = serde_json::from_value(serde_json::json!({
            "id": "m-9",
            "sender_id": "u1",
            "recipient_id": "u2",
            "message": "hello",
            "is_read": false,
            "created_at": "2026-01-05T10:00:00Z",
            "sender": {"username": "alice"}
        }))
        .unwrap();
        assert_eq!(record.status, DeliveryStatus::Sent);
        assert!(!record.id.is_local());
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        assert_eq!(MessageRecord::snippet("héllo wörld", 4), "héll");
        assert_eq!(MessageRecord::snippet("hi", 50), "hi");
    }
}
