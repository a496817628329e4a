//! Cache synchronization: pushed domain events to cache operations.
//!
//! [`SyncPlan::for_event`] is the whole event table as a pure function.
//! [`register_domain_handlers`] wires it onto a [`ConnectionHandle`] as up
//! to three handlers per event kind, run in the order evict, invalidate,
//! notify.

use ship_cache::QueryCache;
use ship_core::{keys, DomainEvent, EventKind, QueryKey};
use tracing::debug;

use crate::notifications::{Notification, Notifier};
use crate::realtime::{ConnectionHandle, HandlerError, RealtimeError};

/// The part of a [`SyncPlan`] one handler applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRole {
    Evict,
    Invalidate,
    Notify,
}

/// Which handlers an event kind gets, in execution order.
pub fn roles(kind: EventKind) -> &'static [HandlerRole] {
    use HandlerRole::*;
    match kind {
        EventKind::ProjectDeleted => &[Evict, Invalidate],
        EventKind::ProjectCreated
        | EventKind::ProjectFeatured
        | EventKind::BadgeAwarded
        | EventKind::IntroReceived
        | EventKind::IntroAccepted
        | EventKind::IntroDeclined
        | EventKind::MessageReceived => &[Invalidate, Notify],
        EventKind::ProjectUpdated
        | EventKind::VoteCast
        | EventKind::VoteRemoved
        | EventKind::CommentAdded
        | EventKind::CommentUpdated
        | EventKind::CommentDeleted
        | EventKind::CommentVoted
        | EventKind::LeaderboardUpdated
        | EventKind::UserUpdated
        | EventKind::MessageRead
        | EventKind::MessagesRead => &[Invalidate],
    }
}

/// Cache operations and the notification one event calls for.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub evict: Vec<QueryKey>,
    pub invalidate: Vec<QueryKey>,
    pub notification: Option<Notification>,
}

impl SyncPlan {
    fn invalidating(keys: Vec<QueryKey>) -> Self {
        Self {
            invalidate: keys,
            ..Self::default()
        }
    }

    fn notify(mut self, notification: Notification) -> Self {
        self.notification = Some(notification);
        self
    }

    pub fn for_event(event: &DomainEvent) -> Self {
        match event {
            DomainEvent::ProjectCreated { message } => {
                let mut notification = Notification::success("New project published!");
                if let Some(message) = message.as_deref().filter(|m| !m.is_empty()) {
                    notification = notification.with_description(message);
                }
                Self::invalidating(vec![keys::projects(), keys::leaderboard()]).notify(notification)
            }
            DomainEvent::ProjectUpdated { project_id } => {
                Self::invalidating(vec![keys::project(project_id), keys::projects()])
            }
            DomainEvent::ProjectDeleted { project_id } => Self {
                evict: vec![keys::project(project_id)],
                invalidate: vec![keys::projects(), keys::leaderboard()],
                notification: None,
            },
            DomainEvent::ProjectFeatured { project_id } => {
                Self::invalidating(vec![keys::project(project_id), keys::projects()])
                    .notify(Notification::success("Project featured!"))
            }
            DomainEvent::VoteCast { project_id } | DomainEvent::VoteRemoved { project_id } => {
                Self::invalidating(vec![
                    keys::project(project_id),
                    keys::projects(),
                    keys::leaderboard(),
                ])
            }
            DomainEvent::CommentAdded { project_id }
            | DomainEvent::CommentUpdated { project_id }
            | DomainEvent::CommentDeleted { project_id } => {
                Self::invalidating(vec![keys::project(project_id), keys::comments(project_id)])
            }
            DomainEvent::CommentVoted { project_id } => {
                Self::invalidating(vec![keys::comments(project_id)])
            }
            DomainEvent::LeaderboardUpdated => Self::invalidating(vec![keys::leaderboard()]),
            DomainEvent::UserUpdated { user_id } => Self::invalidating(vec![keys::user(user_id)]),
            DomainEvent::BadgeAwarded { project_id } => Self::invalidating(vec![
                keys::project(project_id),
                keys::badges(project_id),
                keys::leaderboard(),
            ])
            .notify(Notification::success("New badge awarded!")),
            DomainEvent::IntroReceived => Self::invalidating(vec![keys::intros_received()])
                .notify(Notification::info("New intro request received!")),
            DomainEvent::IntroAccepted => Self::invalidating(vec![keys::intros_sent()])
                .notify(Notification::success("Your intro request was accepted!")),
            DomainEvent::IntroDeclined => Self::invalidating(vec![keys::intros_sent()])
                .notify(Notification::info("Your intro request was declined")),
            DomainEvent::MessageReceived {
                sender_id,
                sender_name,
                ..
            } => {
                let mut invalidate = Vec::with_capacity(2);
                if let Some(sender) = sender_id {
                    invalidate.push(keys::conversation(sender));
                }
                invalidate.push(keys::conversations());
                let name = sender_name
                    .as_deref()
                    .filter(|n| !n.is_empty())
                    .unwrap_or("Someone");
                let description = event
                    .message_snippet()
                    .unwrap_or_else(|| "View message".to_string());
                Self::invalidating(invalidate).notify(
                    Notification::info(format!("New message from {}", name))
                        .with_description(description),
                )
            }
            DomainEvent::MessageRead { sender_id } | DomainEvent::MessagesRead { sender_id } => {
                match sender_id {
                    Some(sender) => {
                        Self::invalidating(vec![keys::conversation(sender), keys::conversations()])
                    }
                    None => Self::invalidating(vec![keys::messages()]),
                }
            }
        }
    }

    /// Roles this plan actually needs.
    pub fn roles(&self) -> Vec<HandlerRole> {
        let mut roles = Vec::new();
        if !self.evict.is_empty() {
            roles.push(HandlerRole::Evict);
        }
        if !self.invalidate.is_empty() {
            roles.push(HandlerRole::Invalidate);
        }
        if self.notification.is_some() {
            roles.push(HandlerRole::Notify);
        }
        roles
    }
}

fn apply(
    role: HandlerRole,
    event: &DomainEvent,
    cache: &QueryCache,
    notifier: &Notifier,
) -> Result<(), HandlerError> {
    let plan = SyncPlan::for_event(event);
    match role {
        HandlerRole::Evict => {
            for key in &plan.evict {
                let removed = cache.evict(key)?;
                debug!(event = %event.kind(), key = %key, removed, "Evicted");
            }
        }
        HandlerRole::Invalidate => {
            for key in &plan.invalidate {
                let matched = cache.invalidate(key)?;
                debug!(event = %event.kind(), key = %key, matched, "Invalidated");
            }
        }
        HandlerRole::Notify => {
            if let Some(notification) = plan.notification {
                notifier.notify(notification);
            }
        }
    }
    Ok(())
}

/// Attach the synchronization handlers for every event kind.
///
/// Registration happens once per handle; later calls return `Ok(false)`.
pub fn register_domain_handlers(
    handle: &ConnectionHandle,
    cache: &QueryCache,
    notifier: &Notifier,
) -> Result<bool, RealtimeError> {
    if !handle.claim_domain_registration() {
        debug!("Domain handlers already registered");
        return Ok(false);
    }
    for kind in EventKind::ALL {
        for &role in roles(kind) {
            let cache = cache.clone();
            let notifier = notifier.clone();
            handle.on(kind, move |event| apply(role, event, &cache, &notifier))?;
        }
    }
    debug!(kinds = EventKind::ALL.len(), "Domain handlers registered");
    Ok(true)
}
