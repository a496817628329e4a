//! 0x.ship Test Utilities
//!
//! Shared test infrastructure for the sync-client workspace:
//! - Mock backends for the fetcher, mutation and event-stream seams
//! - Proptest generators for keys, votes and domain events
//! - Fixtures for configs, project payloads and wire events
//! - Assertions for cache state and a polling wait helper

// Re-export core types for convenience
pub use ship_cache::{CacheConfig, CacheEntry, EntryStatus, FetchError, QueryCache, QueryFetcher};
pub use ship_client::api_client::{ApiClientError, MessageApi, SaveApi, VoteApi};
pub use ship_client::socketio::{Connector, EventStream, TransportError, TransportKind, WireEvent};
pub use ship_core::{
    keys, DomainEvent, EventKind, ProjectId, QueryKey, UserId, VoteCounts, VoteDirection,
    VoteTally,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Semaphore};

/// Optional gate a mock call waits on until a permit is released.
#[derive(Debug, Default)]
struct Gate(Option<Semaphore>);

impl Gate {
    fn closed() -> Self {
        Self(Some(Semaphore::new(0)))
    }

    async fn pass(&self) {
        if let Some(gate) = &self.0 {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }

    fn release(&self, calls: usize) {
        if let Some(gate) = &self.0 {
            gate.add_permits(calls);
        }
    }
}

// ============================================================================
// MOCK FETCHER
// ============================================================================

/// Fetcher serving scripted values per key.
///
/// Keys with no script fail as unroutable. A gated fetcher holds every call
/// until [`MockFetcher::release`] lets it through.
#[derive(Debug, Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<QueryKey, Result<Value, String>>>,
    calls: Mutex<HashMap<QueryKey, usize>>,
    in_flight: Mutex<HashMap<QueryKey, usize>>,
    peak_in_flight: Mutex<HashMap<QueryKey, usize>>,
    total: AtomicUsize,
    gate: Gate,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Gate::closed(),
            ..Self::default()
        }
    }

    pub fn with_response(self, key: QueryKey, value: Value) -> Self {
        self.set_response(key, value);
        self
    }

    pub fn set_response(&self, key: QueryKey, value: Value) {
        lock(&self.responses).insert(key, Ok(value));
    }

    pub fn fail(&self, key: QueryKey, reason: impl Into<String>) {
        lock(&self.responses).insert(key, Err(reason.into()));
    }

    /// Let `calls` gated fetches complete.
    pub fn release(&self, calls: usize) {
        self.gate.release(calls);
    }

    pub fn calls(&self, key: &QueryKey) -> usize {
        lock(&self.calls).get(key).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Most fetches ever running at once for `key`.
    pub fn peak_in_flight(&self, key: &QueryKey) -> usize {
        lock(&self.peak_in_flight).get(key).copied().unwrap_or(0)
    }

    fn enter(&self, key: &QueryKey) {
        self.total.fetch_add(1, Ordering::SeqCst);
        *lock(&self.calls).entry(key.clone()).or_insert(0) += 1;
        let running = {
            let mut in_flight = lock(&self.in_flight);
            let n = in_flight.entry(key.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let mut peak = lock(&self.peak_in_flight);
        let best = peak.entry(key.clone()).or_insert(0);
        *best = (*best).max(running);
    }

    fn leave(&self, key: &QueryKey) {
        if let Some(n) = lock(&self.in_flight).get_mut(key) {
            *n = n.saturating_sub(1);
        }
    }
}

#[async_trait]
impl QueryFetcher for MockFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError> {
        self.enter(key);
        self.gate.pass().await;
        // Read the script after the gate so tests can change it mid-flight.
        let scripted = lock(&self.responses).get(key).cloned();
        self.leave(key);
        match scripted {
            Some(Ok(value)) => Ok(value),
            Some(Err(reason)) => Err(FetchError::new(reason)),
            None => Err(FetchError::unroutable(key)),
        }
    }
}

// ============================================================================
// MOCK MUTATION BACKENDS
// ============================================================================

/// Vote endpoint replaying queued replies.
///
/// With no reply queued it answers `Ok(None)`, as the backend does for a
/// vote reply without counts.
#[derive(Debug, Default)]
pub struct MockVoteApi {
    replies: Mutex<VecDeque<Result<Option<VoteCounts>, ApiClientError>>>,
    calls: Mutex<Vec<(ProjectId, VoteDirection)>>,
    gate: Gate,
}

impl MockVoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Gate::closed(),
            ..Self::default()
        }
    }

    pub fn with_reply(self, reply: Result<Option<VoteCounts>, ApiClientError>) -> Self {
        self.push_reply(reply);
        self
    }

    pub fn push_reply(&self, reply: Result<Option<VoteCounts>, ApiClientError>) {
        lock(&self.replies).push_back(reply);
    }

    pub fn release(&self, calls: usize) {
        self.gate.release(calls);
    }

    pub fn calls(&self) -> Vec<(ProjectId, VoteDirection)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl VoteApi for MockVoteApi {
    async fn cast_vote(
        &self,
        project_id: &ProjectId,
        direction: VoteDirection,
    ) -> Result<Option<VoteCounts>, ApiClientError> {
        lock(&self.calls).push((project_id.clone(), direction));
        self.gate.pass().await;
        lock(&self.replies).pop_front().unwrap_or(Ok(None))
    }
}

/// Message endpoint replaying queued replies.
///
/// With no reply queued it echoes a server record with a numeric id.
#[derive(Debug, Default)]
pub struct MockMessageApi {
    replies: Mutex<VecDeque<Result<Value, ApiClientError>>>,
    sent: Mutex<Vec<(UserId, String)>>,
    next_id: AtomicUsize,
    gate: Gate,
}

impl MockMessageApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> Self {
        Self {
            gate: Gate::closed(),
            ..Self::default()
        }
    }

    pub fn push_reply(&self, reply: Result<Value, ApiClientError>) {
        lock(&self.replies).push_back(reply);
    }

    pub fn release(&self, calls: usize) {
        self.gate.release(calls);
    }

    pub fn sent(&self) -> Vec<(UserId, String)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl MessageApi for MockMessageApi {
    async fn send_message(&self, recipient: &UserId, text: &str) -> Result<Value, ApiClientError> {
        lock(&self.sent).push((recipient.clone(), text.to_string()));
        self.gate.pass().await;
        if let Some(reply) = lock(&self.replies).pop_front() {
            return reply;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({
            "id": id,
            "sender_id": "me",
            "recipient_id": recipient.as_str(),
            "message": text,
            "is_read": false,
        }))
    }
}

/// Bookmark endpoint that succeeds until told to fail.
#[derive(Debug, Default)]
pub struct MockSaveApi {
    failing: AtomicBool,
    /// `(saved, project)` per call, `saved` false for unsave.
    calls: Mutex<Vec<(bool, ProjectId)>>,
}

impl MockSaveApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(bool, ProjectId)> {
        lock(&self.calls).clone()
    }

    fn reply(&self, saved: bool, project_id: &ProjectId) -> Result<(), ApiClientError> {
        lock(&self.calls).push((saved, project_id.clone()));
        if self.failing.load(Ordering::SeqCst) {
            return Err(ApiClientError::Status {
                status: 500,
                message: None,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SaveApi for MockSaveApi {
    async fn save_project(&self, project_id: &ProjectId) -> Result<(), ApiClientError> {
        self.reply(true, project_id)
    }

    async fn unsave_project(&self, project_id: &ProjectId) -> Result<(), ApiClientError> {
        self.reply(false, project_id)
    }
}

// ============================================================================
// MOCK EVENT STREAM
// ============================================================================

/// Connector handing out in-memory event streams.
///
/// Events pushed with [`MockConnector::emit`] reach the most recently opened
/// stream. [`MockConnector::drop_stream`] ends it as a server close would.
#[derive(Debug)]
pub struct MockConnector {
    current: Mutex<Option<mpsc::UnboundedSender<WireEvent>>>,
    refused: Mutex<HashSet<TransportKind>>,
    attempts: Mutex<Vec<TransportKind>>,
    opened: watch::Sender<usize>,
    closed: Arc<AtomicUsize>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        let (opened, _) = watch::channel(0);
        Self {
            current: Mutex::new(None),
            refused: Mutex::new(HashSet::new()),
            attempts: Mutex::new(Vec::new()),
            opened,
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Refuse every open on `transport`.
    pub fn refuse(&self, transport: TransportKind) {
        lock(&self.refused).insert(transport);
    }

    pub fn accept(&self, transport: TransportKind) {
        lock(&self.refused).remove(&transport);
    }

    /// Push an event to the open stream. False if none is open.
    pub fn emit(&self, event: WireEvent) -> bool {
        match lock(&self.current).as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn emit_domain(&self, event: &DomainEvent) -> bool {
        self.emit(fixtures::wire_event(event))
    }

    /// End the open stream.
    pub fn drop_stream(&self) {
        lock(&self.current).take();
    }

    /// Streams successfully opened so far.
    pub fn opens(&self) -> usize {
        *self.opened.borrow()
    }

    /// Every open attempt, refused ones included.
    pub fn attempts(&self) -> Vec<TransportKind> {
        lock(&self.attempts).clone()
    }

    /// Streams closed by the client.
    pub fn closes(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` streams have been opened.
    pub async fn wait_for_opens(&self, count: usize) {
        let mut rx = self.opened.subscribe();
        // The sender lives in self, so the channel cannot close here.
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        _base_url: &str,
        transport: TransportKind,
    ) -> Result<Box<dyn EventStream>, TransportError> {
        lock(&self.attempts).push(transport);
        if lock(&self.refused).contains(&transport) {
            return Err(TransportError::ConnectRefused(format!(
                "{} refused by mock",
                transport
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.current) = Some(tx);
        self.opened.send_modify(|n| *n += 1);
        Ok(Box::new(MockEventStream {
            rx,
            transport,
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Stream side of [`MockConnector`].
pub struct MockEventStream {
    rx: mpsc::UnboundedReceiver<WireEvent>,
    transport: TransportKind,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl EventStream for MockEventStream {
    async fn next_event(&mut self) -> Result<Option<WireEvent>, TransportError> {
        Ok(self.rx.recv().await)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.rx.close();
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_project_id() -> impl Strategy<Value = ProjectId> {
        prop_oneof![
            "[a-z0-9]{1,12}".prop_map(ProjectId::new),
            (1u32..100_000).prop_map(|n| ProjectId::new(n.to_string())),
        ]
    }

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        "[a-z0-9]{1,12}".prop_map(UserId::new)
    }

    pub fn arb_vote_direction() -> impl Strategy<Value = VoteDirection> {
        prop_oneof![Just(VoteDirection::Up), Just(VoteDirection::Down)]
    }

    pub fn arb_vote_tally() -> impl Strategy<Value = VoteTally> {
        (-1_000i64..1_000, proptest::option::of(arb_vote_direction()))
            .prop_map(|(count, user_vote)| VoteTally::new(count, user_vote))
    }

    pub fn arb_vote_counts() -> impl Strategy<Value = VoteCounts> {
        (0i64..1_000, 0i64..1_000, proptest::option::of(arb_vote_direction())).prop_map(
            |(upvotes, downvotes, user_vote)| VoteCounts {
                upvotes,
                downvotes,
                user_vote,
            },
        )
    }

    /// Keys drawn from the cache key taxonomy.
    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        prop_oneof![
            (prop_oneof![Just("hot"), Just("new"), Just("top")], 1u32..5)
                .prop_map(|(sort, page)| keys::feed(sort, page)),
            arb_project_id().prop_map(|id| keys::project(&id)),
            arb_project_id().prop_map(|id| keys::comments(&id)),
            arb_project_id().prop_map(|id| keys::badges(&id)),
            (1u32..100).prop_map(keys::leaderboard_projects),
            (1u32..100).prop_map(keys::leaderboard_builders),
            arb_user_id().prop_map(|id| keys::user(&id)),
            Just(keys::intros_received()),
            arb_user_id().prop_map(|id| keys::conversation(&id)),
            arb_project_id().prop_map(|id| keys::saved_check(&id)),
        ]
    }

    pub fn arb_event_kind() -> impl Strategy<Value = EventKind> {
        proptest::sample::select(EventKind::ALL.to_vec())
    }

    fn arb_project_event() -> impl Strategy<Value = DomainEvent> {
        prop_oneof![
            proptest::option::of("[a-zA-Z ]{0,20}")
                .prop_map(|message| DomainEvent::ProjectCreated { message }),
            arb_project_id().prop_map(|project_id| DomainEvent::ProjectUpdated { project_id }),
            arb_project_id().prop_map(|project_id| DomainEvent::ProjectDeleted { project_id }),
            arb_project_id().prop_map(|project_id| DomainEvent::ProjectFeatured { project_id }),
            arb_project_id().prop_map(|project_id| DomainEvent::VoteCast { project_id }),
            arb_project_id().prop_map(|project_id| DomainEvent::VoteRemoved { project_id }),
            arb_project_id().prop_map(|project_id| DomainEvent::BadgeAwarded { project_id }),
        ]
    }

    fn arb_comment_event() -> impl Strategy<Value = DomainEvent> {
        prop_oneof![
            arb_project_id().prop_map(|project_id| DomainEvent::CommentAdded { project_id }),
            arb_project_id().prop_map(|project_id| DomainEvent::CommentUpdated { project_id }),
            arb_project_id().prop_map(|project_id| DomainEvent::CommentDeleted { project_id }),
            arb_project_id().prop_map(|project_id| DomainEvent::CommentVoted { project_id }),
        ]
    }

    fn arb_social_event() -> impl Strategy<Value = DomainEvent> {
        let sender = || proptest::option::of(arb_user_id());
        prop_oneof![
            Just(DomainEvent::LeaderboardUpdated),
            arb_user_id().prop_map(|user_id| DomainEvent::UserUpdated { user_id }),
            Just(DomainEvent::IntroReceived),
            Just(DomainEvent::IntroAccepted),
            Just(DomainEvent::IntroDeclined),
            (
                sender(),
                proptest::option::of("[a-z]{1,10}"),
                proptest::option::of(".{0,80}")
            )
                .prop_map(|(sender_id, sender_name, text)| DomainEvent::MessageReceived {
                    sender_id,
                    sender_name,
                    text,
                }),
            sender().prop_map(|sender_id| DomainEvent::MessageRead { sender_id }),
            sender().prop_map(|sender_id| DomainEvent::MessagesRead { sender_id }),
        ]
    }

    pub fn arb_domain_event() -> impl Strategy<Value = DomainEvent> {
        prop_oneof![arb_project_event(), arb_comment_event(), arb_social_event()]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use ship_client::ShipConfig;
    use std::path::Path;

    /// Config pointing at unroutable hosts, with credentials under `dir`.
    pub fn config(dir: &Path) -> ShipConfig {
        let toml = format!(
            r#"
api_base_url = "http://127.0.0.1:9/api"
socket_url = "http://127.0.0.1:9"
request_timeout_ms = 500
credentials_path = {:?}

[reconnect]
attempts = 3
delay_ms = 10
"#,
            dir.join("credentials.json")
        );
        match ShipConfig::from_toml(&toml) {
            Ok(config) => config,
            Err(err) => panic!("fixture config is invalid: {err}"),
        }
    }

    /// Project payload as the backend sends it, netting to `vote_count`.
    pub fn project(id: &str, vote_count: i64, user_vote: Option<VoteDirection>) -> Value {
        json!({
            "id": id,
            "title": format!("Project {id}"),
            "upvotes": vote_count.max(0),
            "downvotes": (-vote_count).max(0),
            "user_vote": user_vote.map(|d| d.as_str()),
        })
    }

    /// Project payload in its normalized camelCase form.
    pub fn cached_project(id: &str, vote_count: i64, user_vote: Option<VoteDirection>) -> Value {
        ship_core::normalize_project(project(id, vote_count, user_vote))
    }

    /// The wire event the backend emits for `event`.
    pub fn wire_event(event: &DomainEvent) -> WireEvent {
        let payload = match event {
            DomainEvent::ProjectCreated { message } => json!({ "message": message }),
            DomainEvent::ProjectUpdated { project_id }
            | DomainEvent::ProjectDeleted { project_id }
            | DomainEvent::ProjectFeatured { project_id }
            | DomainEvent::VoteCast { project_id }
            | DomainEvent::VoteRemoved { project_id }
            | DomainEvent::CommentAdded { project_id }
            | DomainEvent::CommentUpdated { project_id }
            | DomainEvent::CommentDeleted { project_id }
            | DomainEvent::CommentVoted { project_id }
            | DomainEvent::BadgeAwarded { project_id } => {
                json!({ "project_id": project_id.as_str() })
            }
            DomainEvent::UserUpdated { user_id } => json!({ "user_id": user_id.as_str() }),
            DomainEvent::LeaderboardUpdated
            | DomainEvent::IntroReceived
            | DomainEvent::IntroAccepted
            | DomainEvent::IntroDeclined => Value::Null,
            DomainEvent::MessageReceived {
                sender_id,
                sender_name,
                text,
            } => json!({
                "data": {
                    "sender_id": sender_id.as_ref().map(|id| id.as_str()),
                    "sender": { "username": sender_name },
                    "message": text,
                }
            }),
            DomainEvent::MessageRead { sender_id } | DomainEvent::MessagesRead { sender_id } => {
                json!({ "sender_id": sender_id.as_ref().map(|id| id.as_str()) })
            }
        };
        WireEvent::new(event.kind().as_str(), payload)
    }

    /// A cache seeded with `entries` and no fetcher.
    pub fn seeded_cache(entries: Vec<(QueryKey, Value)>) -> QueryCache {
        let cache = QueryCache::new(CacheConfig::default());
        for (key, value) in entries {
            if let Err(err) = cache.set_data(key, value) {
                panic!("seeding cache failed: {err}");
            }
        }
        cache
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;

    /// Assert the vote tally cached for a project.
    pub fn assert_cached_tally(cache: &QueryCache, project_id: &ProjectId, expected: VoteTally) {
        let data = cache
            .get_data(&keys::project(project_id))
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("no cached project {project_id}"));
        let tally = ship_core::read_vote_tally(&data)
            .unwrap_or_else(|| panic!("cached project {project_id} has no vote fields"));
        assert_eq!(tally, expected, "cached tally of project {project_id}");
    }

    pub fn assert_status(cache: &QueryCache, key: &QueryKey, expected: EntryStatus) {
        let status = cache.status(key).ok().flatten();
        assert_eq!(status, Some(expected), "status of {key}");
    }

    pub fn assert_absent(cache: &QueryCache, key: &QueryKey) {
        assert!(
            !cache.contains(key).unwrap_or(true),
            "expected {key} to be evicted"
        );
    }
}

/// Yield to the runtime until `done` holds.
///
/// Panics after two seconds so a missed condition fails the test instead
/// of hanging it.
pub async fn until(mut done: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while !done() {
            tokio::task::yield_now().await;
        }
    })
    .await;
    if waited.is_err() {
        panic!("condition not reached within two seconds");
    }
}

// ============================================================================
// TESTS
// ============================================================================
