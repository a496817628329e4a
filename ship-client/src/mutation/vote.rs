//! Optimistic voting.

use ship_cache::QueryCache;
use ship_core::{
    keys, patch_vote_tally, read_vote_tally, ProjectId, VoteCounts, VoteDirection, VoteTally,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::{MutationPhase, MutationRecord, SubmitOutcome};
use crate::api_client::VoteApi;
use crate::notifications::{Notification, Notifier};

/// State handed to the settle callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteSnapshot {
    pub tally: VoteTally,
    pub phase: MutationPhase,
}

type SettledCallback = Box<dyn Fn(&VoteSnapshot) + Send + Sync>;

#[derive(Debug)]
struct VoteState {
    tally: VoteTally,
    phase: MutationPhase,
    last: Option<MutationRecord<VoteTally>>,
}

/// Vote state of one project for the signed-in user.
pub struct VoteController {
    project_id: ProjectId,
    api: Arc<dyn VoteApi>,
    cache: QueryCache,
    notifier: Notifier,
    state: Mutex<VoteState>,
    on_settled: Option<SettledCallback>,
}

impl VoteController {
    pub fn new(
        project_id: ProjectId,
        initial: VoteTally,
        api: Arc<dyn VoteApi>,
        cache: QueryCache,
        notifier: Notifier,
    ) -> Self {
        Self {
            project_id,
            api,
            cache,
            notifier,
            state: Mutex::new(VoteState {
                tally: initial,
                phase: MutationPhase::Idle,
                last: None,
            }),
            on_settled: None,
        }
    }

    /// Start from the tally in the cached project, or zero when absent.
    pub fn from_cache(
        project_id: ProjectId,
        api: Arc<dyn VoteApi>,
        cache: QueryCache,
        notifier: Notifier,
    ) -> Self {
        let initial = cached_tally(&cache, &project_id).unwrap_or(VoteTally::new(0, None));
        Self::new(project_id, initial, api, cache, notifier)
    }

    /// Callback fired after every settled submission.
    pub fn on_settled(mut self, callback: impl Fn(&VoteSnapshot) + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Box::new(callback));
        self
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn tally(&self) -> VoteTally {
        self.lock().tally
    }

    pub fn phase(&self) -> MutationPhase {
        self.lock().phase
    }

    pub fn is_pending(&self) -> bool {
        self.phase() == MutationPhase::Pending
    }

    /// Record of the most recent settled submission.
    pub fn last_mutation(&self) -> Option<MutationRecord<VoteTally>> {
        self.lock().last.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VoteState> {
        // The state is plain data; a panic mid-update leaves it usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cast a vote with toggle semantics.
    ///
    /// The transition starts from the tally currently cached for the project,
    /// so a refetch that landed since the last submission is what gets
    /// patched and, on failure, restored.
    pub async fn submit(&self, direction: VoteDirection) -> SubmitOutcome<VoteTally> {
        let displayed = cached_tally(&self.cache, &self.project_id);
        let speculative = {
            let mut state = self.lock();
            if state.phase == MutationPhase::Pending {
                debug!(project = %self.project_id, "Vote already pending; ignoring");
                return SubmitOutcome::Ignored;
            }
            if let Some(displayed) = displayed {
                state.tally = displayed;
            }
            let transition = state.tally.apply(direction);
            state.tally = transition.after;
            state.phase = MutationPhase::Pending;
            state.last = Some(MutationRecord::pending(transition.before, transition.after));
            transition.after
        };
        self.write_cache(speculative);

        let result = self.api.cast_vote(&self.project_id, direction).await;

        let (settled, outcome) = {
            let mut state = self.lock();
            let Some(mut record) = state.last.take() else {
                state.phase = MutationPhase::Idle;
                return SubmitOutcome::Ignored;
            };
            let outcome = match result {
                Ok(server) => {
                    let confirmed = record.confirm(reconcile(speculative, server));
                    SubmitOutcome::Confirmed(confirmed)
                }
                Err(error) => SubmitOutcome::RolledBack {
                    restored: record.roll_back(),
                    error,
                },
            };
            let final_tally = match &outcome {
                SubmitOutcome::Confirmed(tally) => *tally,
                SubmitOutcome::RolledBack { restored, .. } => *restored,
                SubmitOutcome::Ignored => state.tally,
            };
            state.tally = final_tally;
            let snapshot = VoteSnapshot {
                tally: final_tally,
                phase: record.phase,
            };
            state.last = Some(record);
            state.phase = MutationPhase::Idle;
            (snapshot, outcome)
        };
        self.write_cache(settled.tally);

        match &outcome {
            SubmitOutcome::Confirmed(tally) => {
                for prefix in [keys::projects(), keys::leaderboard()] {
                    if let Err(err) = self.cache.invalidate(&prefix) {
                        warn!(key = %prefix, error = %err, "Invalidation after vote failed");
                    }
                }
                let message = if tally.user_vote.is_some() {
                    "Vote recorded"
                } else {
                    "Vote removed"
                };
                self.notifier.notify(Notification::success(message));
            }
            SubmitOutcome::RolledBack { error, .. } => {
                warn!(project = %self.project_id, error = %error, "Vote failed; rolled back");
                let message = error.server_message().unwrap_or("Failed to vote");
                self.notifier.notify(Notification::error(message));
            }
            SubmitOutcome::Ignored => {}
        }

        if let Some(callback) = &self.on_settled {
            callback(&settled);
        }
        outcome
    }

    fn write_cache(&self, tally: VoteTally) {
        let key = keys::project(&self.project_id);
        match self.cache.update_data(&key, |project| patch_vote_tally(project, tally)) {
            Ok(Some(Err(err))) => warn!(key = %key, error = %err, "Cached project has unexpected shape"),
            Ok(_) => {}
            Err(err) => warn!(key = %key, error = %err, "Failed to patch cached vote"),
        }
    }
}

fn cached_tally(cache: &QueryCache, project_id: &ProjectId) -> Option<VoteTally> {
    cache
        .get_data(&keys::project(project_id))
        .ok()
        .flatten()
        .and_then(|project| read_vote_tally(&project))
}

/// Server truth after a successful vote.
///
/// `None` means the server removed the vote: the count is kept and the
/// user's vote cleared.
fn reconcile(speculative: VoteTally, server: Option<VoteCounts>) -> VoteTally {
    match server {
        Some(counts) => counts.tally(),
        None => VoteTally::new(speculative.vote_count, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiClientError;
    use async_trait::async_trait;
    use serde_json::json;
    use ship_cache::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Answers with the given counts once a permit is released.
    struct GatedVotes {
        gate: Semaphore,
        calls: AtomicUsize,
        reply: Mutex<Option<Result<Option<VoteCounts>, ApiClientError>>>,
    }

    impl GatedVotes {
        fn new(reply: Result<Option<VoteCounts>, ApiClientError>, open: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(if open { 1000 } else { 0 }),
                calls: AtomicUsize::new(0),
                reply: Mutex::new(Some(reply)),
            })
        }
    }

    #[async_trait]
    impl VoteApi for GatedVotes {
        async fn cast_vote(
            &self,
            _project_id: &ProjectId,
            _direction: VoteDirection,
        ) -> Result<Option<VoteCounts>, ApiClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
            self.reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(ApiClientError::Envelope("no reply scripted".into())))
        }
    }

    fn controller(api: Arc<GatedVotes>, cache: &QueryCache) -> (VoteController, tokio::sync::mpsc::Receiver<Notification>) {
        let (notifier, rx) = Notifier::channel(8);
        let controller = VoteController::from_cache(ProjectId::new("abc"), api, cache.clone(), notifier);
        (controller, rx)
    }

    fn seeded_cache() -> QueryCache {
        let cache = QueryCache::new(CacheConfig::default());
        cache
            .set_data(
                keys::project(&ProjectId::new("abc")),
                json!({"id": "abc", "voteCount": 5, "userVote": null}),
            )
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn test_confirmed_vote_matches_server() {
        let cache = seeded_cache();
        let api = GatedVotes::new(
            Ok(Some(VoteCounts {
                upvotes: 6,
                downvotes: 0,
                user_vote: Some(VoteDirection::Up),
            })),
            true,
        );
        let (controller, mut rx) = controller(api, &cache);
        assert_eq!(controller.tally(), VoteTally::new(5, None));

        let outcome = controller.submit(VoteDirection::Up).await;
        assert!(outcome.is_confirmed());
        let cached = cache.get_data(&keys::project(&ProjectId::new("abc"))).unwrap().unwrap();
        assert_eq!(cached["voteCount"], 6);
        assert_eq!(cached["userVote"], "up");
        assert_eq!(rx.try_recv().unwrap().message, "Vote recorded");
    }

    #[tokio::test]
    async fn test_failure_restores_snapshot() {
        let cache = seeded_cache();
        let api = GatedVotes::new(
            Err(ApiClientError::Status {
                status: 400,
                message: Some("Cannot vote on your own project".into()),
            }),
            true,
        );
        let settled = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&settled);
        let (notifier, mut rx) = Notifier::channel(8);
        let controller = VoteController::from_cache(ProjectId::new("abc"), api, cache.clone(), notifier)
            .on_settled(move |snapshot| *seen.lock().unwrap() = Some(*snapshot));

        let outcome = controller.submit(VoteDirection::Down).await;
        assert!(outcome.is_rolled_back());
        assert_eq!(controller.tally(), VoteTally::new(5, None));
        let cached = cache.get_data(&keys::project(&ProjectId::new("abc"))).unwrap().unwrap();
        assert_eq!(read_vote_tally(&cached), Some(VoteTally::new(5, None)));
        assert_eq!(rx.try_recv().unwrap().message, "Cannot vote on your own project");
        assert_eq!(
            settled.lock().unwrap().unwrap().phase,
            MutationPhase::RolledBack
        );
    }

    #[tokio::test]
    async fn test_second_submit_while_pending_is_ignored() {
        let cache = seeded_cache();
        let api = GatedVotes::new(Ok(None), false);
        let (controller, _rx) = controller(Arc::clone(&api), &cache);
        let controller = Arc::new(controller);

        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.submit(VoteDirection::Up).await })
        };
        while api.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(controller.is_pending());
        assert_eq!(controller.tally(), VoteTally::new(6, Some(VoteDirection::Up)));

        assert!(controller.submit(VoteDirection::Up).await.is_ignored());
        api.gate.add_permits(1);
        let outcome = first.await.unwrap();

        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        // Server reported removal: count kept, vote cleared.
        assert!(matches!(outcome, SubmitOutcome::Confirmed(t) if t == VoteTally::new(6, None)));
        assert_eq!(controller.phase(), MutationPhase::Idle);
    }

    #[tokio::test]
    async fn test_refetch_before_submit_is_the_rollback_target() {
        let cache = seeded_cache();
        let api = GatedVotes::new(Err(ApiClientError::Status { status: 500, message: None }), false);
        let (controller, _rx) = controller(Arc::clone(&api), &cache);
        let controller = Arc::new(controller);
        let key = keys::project(&ProjectId::new("abc"));
        cache
            .set_data(key.clone(), json!({"id": "abc", "voteCount": 20, "userVote": null}))
            .unwrap();

        let pending = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.submit(VoteDirection::Up).await })
        };
        while api.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let speculative = read_vote_tally(&cache.get_data(&key).unwrap().unwrap());
        assert_eq!(speculative, Some(VoteTally::new(21, Some(VoteDirection::Up))));

        api.gate.add_permits(1);
        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::RolledBack { restored, .. } if restored == VoteTally::new(20, None)));
        let restored = read_vote_tally(&cache.get_data(&key).unwrap().unwrap());
        assert_eq!(restored, Some(VoteTally::new(20, None)));
    }

    #[test]
    fn test_reconcile() {
        let speculative = VoteTally::new(11, Some(VoteDirection::Up));
        assert_eq!(reconcile(speculative, None), VoteTally::new(11, None));
        let counts = VoteCounts {
            upvotes: 3,
            downvotes: 5,
            user_vote: Some(VoteDirection::Down),
        };
        assert_eq!(
            reconcile(speculative, Some(counts)),
            VoteTally::new(-2, Some(VoteDirection::Down))
        );
    }
}
