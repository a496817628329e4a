//! Optimistic message sending.
//!
//! A provisional record is appended to the cached conversation before the
//! network call. On success it is replaced by the server's record; on
//! failure it is removed, the text goes back into the draft and an error
//! notification offers a retry.

use serde_json::Value;
use ship_cache::QueryCache;
use ship_core::{
    keys, DeliveryStatus, MessageRecord, PayloadError, QueryKey, UserId, ValidationError,
};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{MutationError, SubmitOutcome};
use crate::api_client::MessageApi;
use crate::notifications::{Notification, NotificationAction, Notifier};

#[derive(Debug, Default)]
struct ComposerState {
    draft: String,
    /// Text of the last send that failed, kept for retry.
    failed: Option<String>,
    in_flight: usize,
}

/// Composer and send pipeline for one conversation.
pub struct MessageSendController {
    recipient: UserId,
    api: Arc<dyn MessageApi>,
    cache: QueryCache,
    notifier: Notifier,
    state: Mutex<ComposerState>,
    scroll: watch::Sender<u64>,
}

impl MessageSendController {
    pub fn new(recipient: UserId, api: Arc<dyn MessageApi>, cache: QueryCache, notifier: Notifier) -> Self {
        let (scroll, _) = watch::channel(0);
        Self {
            recipient,
            api,
            cache,
            notifier,
            state: Mutex::new(ComposerState::default()),
            scroll,
        }
    }

    pub fn recipient(&self) -> &UserId {
        &self.recipient
    }

    fn conversation_key(&self) -> QueryKey {
        keys::conversation(&self.recipient)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ComposerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn draft(&self) -> String {
        self.lock().draft.clone()
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        self.lock().draft = text.into();
    }

    /// Text of the last failed send, if it has not been retried.
    pub fn failed_text(&self) -> Option<String> {
        self.lock().failed.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Incremented each time the view should scroll to the newest message.
    pub fn scroll_requests(&self) -> watch::Receiver<u64> {
        self.scroll.subscribe()
    }

    /// Send the current draft.
    pub async fn send_draft(&self) -> Result<SubmitOutcome<MessageRecord>, MutationError> {
        let text = self.draft();
        self.send(&text).await
    }

    /// Send the text of the last failed attempt again.
    pub async fn retry(&self) -> Result<SubmitOutcome<MessageRecord>, MutationError> {
        let Some(text) = self.lock().failed.take() else {
            return Ok(SubmitOutcome::Ignored);
        };
        {
            let mut state = self.lock();
            if state.draft == text {
                state.draft.clear();
            }
        }
        self.send(&text).await
    }

    pub async fn send(&self, text: &str) -> Result<SubmitOutcome<MessageRecord>, MutationError> {
        if text.trim().is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "message".to_string(),
            }
            .into());
        }

        let key = self.conversation_key();
        let provisional = MessageRecord::provisional(self.recipient.clone(), text);
        let local_id = provisional.id.as_str().to_string();
        let provisional_json = serde_json::to_value(&provisional)?;
        self.cache.upsert_data(
            &key,
            || Value::Array(Vec::new()),
            |conversation| -> Result<(), PayloadError> {
                as_list(conversation)?.push(provisional_json);
                Ok(())
            },
        )??;
        {
            let mut state = self.lock();
            state.in_flight += 1;
            if state.draft == text {
                state.draft.clear();
            }
            if state.failed.as_deref() == Some(text) {
                state.failed = None;
            }
        }
        self.scroll.send_modify(|n| *n += 1);
        debug!(key = %key, id = %local_id, "Provisional message appended");

        let result = self.api.send_message(&self.recipient, text).await;
        self.lock().in_flight -= 1;

        match result {
            Ok(server) => {
                let confirmed = self.confirm(&key, &local_id, server, &provisional)?;
                for key in [key, keys::conversations()] {
                    if let Err(err) = self.cache.invalidate(&key) {
                        warn!(key = %key, error = %err, "Invalidation after send failed");
                    }
                }
                Ok(SubmitOutcome::Confirmed(confirmed))
            }
            Err(error) => {
                self.discard(&key, &local_id);
                {
                    let mut state = self.lock();
                    if state.draft.is_empty() {
                        state.draft = text.to_string();
                    }
                    state.failed = Some(text.to_string());
                }
                warn!(recipient = %self.recipient, error = %error, "Message send failed");
                let message = error.server_message().unwrap_or("Failed to send message");
                self.notifier.notify(
                    Notification::error(message)
                        .with_description("Your message was not delivered")
                        .with_action(NotificationAction::Retry),
                );
                Ok(SubmitOutcome::RolledBack {
                    restored: provisional,
                    error,
                })
            }
        }
    }

    /// Swap the provisional record for the server's.
    ///
    /// The server's object goes into the conversation as sent, with every
    /// field it carries. A reply that is not a server-issued message record
    /// confirms the provisional one instead.
    fn confirm(
        &self,
        key: &QueryKey,
        local_id: &str,
        server: Value,
        provisional: &MessageRecord,
    ) -> Result<MessageRecord, MutationError> {
        let record = serde_json::from_value::<MessageRecord>(server.clone())
            .ok()
            .filter(|record| !record.id.is_local());
        let (confirmed, replacement, server_id) = match (record, server) {
            (Some(record), Value::Object(mut fields)) => {
                fields.insert("status".to_string(), Value::from("sent"));
                let server_id = record.id.as_str().to_string();
                let record = MessageRecord {
                    status: DeliveryStatus::Sent,
                    ..record
                };
                (record, Value::Object(fields), Some(server_id))
            }
            _ => {
                let record = MessageRecord {
                    status: DeliveryStatus::Sent,
                    ..provisional.clone()
                };
                let replacement = serde_json::to_value(&record)?;
                (record, replacement, None)
            }
        };

        let patched = self.cache.update_data(key, |conversation| -> Result<(), PayloadError> {
            let list = as_list(conversation)?;
            let Some(pos) = list.iter().position(|m| id_of(m).as_deref() == Some(local_id)) else {
                return Ok(());
            };
            let duplicate = server_id
                .as_deref()
                .is_some_and(|id| list.iter().any(|m| id_of(m).as_deref() == Some(id)));
            if duplicate {
                list.remove(pos);
            } else {
                list[pos] = replacement;
            }
            Ok(())
        })?;
        if let Some(result) = patched {
            result?;
        }
        Ok(confirmed)
    }

    fn discard(&self, key: &QueryKey, local_id: &str) {
        let removed = self.cache.update_data(key, |conversation| {
            if let Value::Array(list) = conversation {
                list.retain(|m| id_of(m).as_deref() != Some(local_id));
            }
        });
        if let Err(err) = removed {
            warn!(key = %key, error = %err, "Failed to remove provisional message");
        }
    }
}

fn as_list(value: &mut Value) -> Result<&mut Vec<Value>, PayloadError> {
    value.as_array_mut().ok_or_else(|| PayloadError::NotAnArray {
        what: "conversation".to_string(),
    })
}

/// Message id as a string; the backend sends integers.
fn id_of(message: &Value) -> Option<String> {
    match message.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiClientError;
    use async_trait::async_trait;
    use serde_json::json;
    use ship_cache::CacheConfig;

    struct ScriptedMessages {
        reply: Mutex<Vec<Result<Value, ApiClientError>>>,
    }

    impl ScriptedMessages {
        fn new(replies: Vec<Result<Value, ApiClientError>>) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl MessageApi for ScriptedMessages {
        async fn send_message(&self, _recipient: &UserId, _text: &str) -> Result<Value, ApiClientError> {
            let next = self.reply.lock().unwrap().pop();
            next.unwrap_or(Err(ApiClientError::Envelope("no reply scripted".into())))
        }
    }

    fn controller(api: Arc<ScriptedMessages>) -> (MessageSendController, QueryCache, tokio::sync::mpsc::Receiver<Notification>) {
        let cache = QueryCache::new(CacheConfig::default());
        let (notifier, rx) = Notifier::channel(8);
        let controller = MessageSendController::new(UserId::new("u2"), api, cache.clone(), notifier);
        (controller, cache, rx)
    }

    fn conversation(cache: &QueryCache) -> Vec<Value> {
        cache
            .get_data(&keys::conversation(&UserId::new("u2")))
            .unwrap()
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_blank_text_is_rejected() {
        let (controller, cache, _rx) = controller(ScriptedMessages::new(vec![]));
        let err = controller.send("   ").await.unwrap_err();
        assert!(matches!(err, MutationError::Validation(_)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_success_replaces_provisional() {
        let api = ScriptedMessages::new(vec![Ok(json!({
            "id": 41,
            "sender_id": "u1",
            "recipient_id": "u2",
            "message": "gm",
            "is_read": false,
            "sender": {"username": "ada"},
            "updated_at": "2026-10-17T09:00:00"
        }))]);
        let (controller, cache, mut rx) = controller(api);
        controller.set_draft("gm");
        let mut scroll = controller.scroll_requests();

        let outcome = controller.send_draft().await.unwrap();
        let SubmitOutcome::Confirmed(record) = outcome else {
            panic!("expected confirmation");
        };
        assert_eq!(record.id.as_str(), "41");
        assert_eq!(record.status, DeliveryStatus::Sent);

        let list = conversation(&cache);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["id"], 41);
        assert_eq!(list[0]["status"], "sent");
        // Fields outside the record type survive until the refetch lands.
        assert_eq!(list[0]["sender"]["username"], "ada");
        assert_eq!(list[0]["updated_at"], "2026-10-17T09:00:00");
        assert_eq!(controller.draft(), "");
        assert!(scroll.has_changed().unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_server_record_drops_provisional() {
        let api = ScriptedMessages::new(vec![Ok(json!({
            "id": "m7",
            "recipient_id": "u2",
            "message": "hi"
        }))]);
        let (controller, cache, _rx) = controller(api);
        cache
            .set_data(
                keys::conversation(&UserId::new("u2")),
                json!([{"id": "m7", "recipient_id": "u2", "message": "hi"}]),
            )
            .unwrap();

        controller.send("hi").await.unwrap();
        let list = conversation(&cache);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["id"], "m7");
    }

    #[tokio::test]
    async fn test_failure_removes_record_and_offers_retry() {
        let api = ScriptedMessages::new(vec![
            Ok(json!({"id": 9, "recipient_id": "u2", "message": "hello"})),
            Err(ApiClientError::Status {
                status: 500,
                message: None,
            }),
        ]);
        let (controller, cache, mut rx) = controller(api);
        controller.set_draft("hello");

        let outcome = controller.send_draft().await.unwrap();
        assert!(outcome.is_rolled_back());
        assert!(conversation(&cache).is_empty());
        assert_eq!(controller.draft(), "hello");
        assert_eq!(controller.failed_text().as_deref(), Some("hello"));
        let notification = rx.try_recv().unwrap();
        assert_eq!(notification.message, "Failed to send message");
        assert_eq!(notification.action, Some(NotificationAction::Retry));

        let retried = controller.retry().await.unwrap();
        assert!(retried.is_confirmed());
        assert_eq!(conversation(&cache).len(), 1);
        assert_eq!(controller.failed_text(), None);
        assert_eq!(controller.draft(), "");
    }

    #[tokio::test]
    async fn test_reply_without_server_id_confirms_provisional() {
        let api = ScriptedMessages::new(vec![Ok(json!({
            "id": "local-echo",
            "recipient_id": "u2",
            "message": "yo"
        }))]);
        let (controller, cache, _rx) = controller(api);

        let SubmitOutcome::Confirmed(record) = controller.send("yo").await.unwrap() else {
            panic!("expected confirmation");
        };
        assert_ne!(record.id.as_str(), "local-echo");
        assert_eq!(record.status, DeliveryStatus::Sent);
        let list = conversation(&cache);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["id"], record.id.as_str());
        assert_eq!(list[0]["status"], "sent");
    }

    #[tokio::test]
    async fn test_retry_without_failure_is_ignored() {
        let (controller, _cache, _rx) = controller(ScriptedMessages::new(vec![]));
        assert!(controller.retry().await.unwrap().is_ignored());
    }

    #[test]
    fn test_id_of_accepts_numbers() {
        assert_eq!(id_of(&json!({"id": 12})).as_deref(), Some("12"));
        assert_eq!(id_of(&json!({"id": "local-1"})).as_deref(), Some("local-1"));
        assert_eq!(id_of(&json!({})), None);
    }
}
