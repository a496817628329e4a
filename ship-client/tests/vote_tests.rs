//! Optimistic voting against a scripted vote endpoint.

use proptest::prelude::*;
use ship_cache::{CacheConfig, QueryCache};
use ship_client::api_client::ApiClientError;
use ship_client::mutation::{MutationPhase, SubmitOutcome, VoteController};
use ship_client::notifications::{Notification, NotificationLevel, Notifier};
use ship_core::{keys, ProjectId, VoteCounts, VoteDirection, VoteTally};
use ship_test_utils::assertions::assert_cached_tally;
use ship_test_utils::generators::{arb_vote_direction, arb_vote_tally};
use ship_test_utils::{fixtures, until, MockVoteApi};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Setup {
    controller: Arc<VoteController>,
    api: Arc<MockVoteApi>,
    cache: QueryCache,
    notifications: mpsc::Receiver<Notification>,
}

fn setup(api: MockVoteApi, tally: VoteTally) -> Setup {
    let id = ProjectId::new("abc");
    let cache = QueryCache::new(CacheConfig::default());
    cache
        .set_data(
            keys::project(&id),
            fixtures::cached_project("abc", tally.vote_count, tally.user_vote),
        )
        .unwrap();
    let (notifier, notifications) = Notifier::channel(16);
    let api = Arc::new(api);
    let controller = Arc::new(VoteController::from_cache(
        id,
        api.clone(),
        cache.clone(),
        notifier,
    ));
    Setup {
        controller,
        api,
        cache,
        notifications,
    }
}

fn server_error() -> ApiClientError {
    ApiClientError::Status {
        status: 500,
        message: None,
    }
}

#[tokio::test]
async fn test_speculative_state_is_visible_before_reply() {
    let s = setup(MockVoteApi::gated(), VoteTally::new(5, None));
    let pending = {
        let controller = s.controller.clone();
        tokio::spawn(async move { controller.submit(VoteDirection::Up).await })
    };
    until(|| s.api.calls().len() == 1).await;

    let speculative = VoteTally::new(6, Some(VoteDirection::Up));
    assert_eq!(s.controller.tally(), speculative);
    assert!(s.controller.is_pending());
    assert_cached_tally(&s.cache, &ProjectId::new("abc"), speculative);

    s.api.release(1);
    assert!(pending.await.unwrap().is_confirmed());
    assert!(!s.controller.is_pending());
}

#[tokio::test]
async fn test_repeat_upvote_returns_to_no_vote() {
    let api = MockVoteApi::gated()
        .with_reply(Ok(Some(VoteCounts {
            upvotes: 11,
            downvotes: 0,
            user_vote: Some(VoteDirection::Up),
        })))
        .with_reply(Ok(None));
    let s = setup(api, VoteTally::new(10, None));
    s.api.release(2);

    s.controller.submit(VoteDirection::Up).await;
    assert_eq!(s.controller.tally(), VoteTally::new(11, Some(VoteDirection::Up)));
    s.controller.submit(VoteDirection::Up).await;
    assert_eq!(s.controller.tally(), VoteTally::new(10, None));
}

#[tokio::test]
async fn test_flip_moves_count_by_two() {
    let s = setup(MockVoteApi::gated(), VoteTally::new(11, Some(VoteDirection::Up)));
    let pending = {
        let controller = s.controller.clone();
        tokio::spawn(async move { controller.submit(VoteDirection::Down).await })
    };
    until(|| s.api.calls().len() == 1).await;

    assert_eq!(s.controller.tally(), VoteTally::new(9, Some(VoteDirection::Down)));
    s.api.release(1);
    pending.await.unwrap();
}

#[tokio::test]
async fn test_confirmed_vote_adopts_server_counts() {
    let api = MockVoteApi::new().with_reply(Ok(Some(VoteCounts {
        upvotes: 9,
        downvotes: 2,
        user_vote: Some(VoteDirection::Up),
    })));
    let mut s = setup(api, VoteTally::new(5, None));

    let outcome = s.controller.submit(VoteDirection::Up).await;

    let expected = VoteTally::new(7, Some(VoteDirection::Up));
    assert!(matches!(outcome, SubmitOutcome::Confirmed(t) if t == expected));
    assert_eq!(s.controller.tally(), expected);
    assert_cached_tally(&s.cache, &ProjectId::new("abc"), expected);
    let toast = s.notifications.try_recv().unwrap();
    assert_eq!(toast.level, NotificationLevel::Success);
    assert_eq!(toast.message, "Vote recorded");
}

#[tokio::test]
async fn test_cleared_vote_reports_removal() {
    let api = MockVoteApi::new().with_reply(Ok(None));
    let mut s = setup(api, VoteTally::new(4, Some(VoteDirection::Down)));

    let outcome = s.controller.submit(VoteDirection::Down).await;

    assert!(matches!(outcome, SubmitOutcome::Confirmed(t) if t == VoteTally::new(5, None)));
    assert_eq!(s.notifications.try_recv().unwrap().message, "Vote removed");
}

#[tokio::test]
async fn test_failed_vote_restores_snapshot() {
    let api = MockVoteApi::new().with_reply(Err(ApiClientError::Status {
        status: 400,
        message: Some("Cannot vote on your own project".into()),
    }));
    let before = VoteTally::new(3, Some(VoteDirection::Down));
    let mut s = setup(api, before);

    let outcome = s.controller.submit(VoteDirection::Up).await;

    assert!(matches!(outcome, SubmitOutcome::RolledBack { restored, .. } if restored == before));
    assert_eq!(s.controller.tally(), before);
    assert_cached_tally(&s.cache, &ProjectId::new("abc"), before);
    assert_eq!(
        s.controller.last_mutation().unwrap().phase,
        MutationPhase::RolledBack
    );
    let toast = s.notifications.try_recv().unwrap();
    assert_eq!(toast.level, NotificationLevel::Error);
    assert_eq!(toast.message, "Cannot vote on your own project");
}

#[tokio::test]
async fn test_submission_while_pending_is_ignored() {
    let s = setup(MockVoteApi::gated(), VoteTally::new(0, None));
    let first = {
        let controller = s.controller.clone();
        tokio::spawn(async move { controller.submit(VoteDirection::Up).await })
    };
    until(|| s.api.calls().len() == 1).await;

    let second = s.controller.submit(VoteDirection::Down).await;
    assert!(second.is_ignored());
    assert_eq!(s.controller.tally(), VoteTally::new(1, Some(VoteDirection::Up)));

    s.api.release(1);
    first.await.unwrap();
    assert_eq!(s.api.calls().len(), 1);
}

#[tokio::test]
async fn test_settle_callback_sees_final_state() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let cache = QueryCache::new(CacheConfig::default());
    let (notifier, _rx) = Notifier::channel(4);
    let api = Arc::new(MockVoteApi::new().with_reply(Err(server_error())));
    let controller = VoteController::new(
        ProjectId::new("abc"),
        VoteTally::new(2, None),
        api,
        cache,
        notifier,
    )
    .on_settled(move |snapshot| {
        let _ = seen_tx.send(*snapshot);
    });

    controller.submit(VoteDirection::Up).await;

    let snapshot = seen_rx.try_recv().unwrap();
    assert_eq!(snapshot.tally, VoteTally::new(2, None));
    assert_eq!(snapshot.phase, MutationPhase::RolledBack);
}

#[tokio::test]
async fn test_confirmed_vote_after_refetch_builds_on_fresh_count() {
    let api = MockVoteApi::gated().with_reply(Ok(Some(VoteCounts {
        upvotes: 22,
        downvotes: 1,
        user_vote: Some(VoteDirection::Up),
    })));
    let s = setup(api, VoteTally::new(5, None));
    let id = ProjectId::new("abc");
    // Another user's vote refetched the project after the controller was built.
    s.cache
        .set_data(keys::project(&id), fixtures::cached_project("abc", 20, None))
        .unwrap();

    let pending = {
        let controller = s.controller.clone();
        tokio::spawn(async move { controller.submit(VoteDirection::Up).await })
    };
    until(|| s.api.calls().len() == 1).await;
    assert_cached_tally(&s.cache, &id, VoteTally::new(21, Some(VoteDirection::Up)));

    s.api.release(1);
    assert!(pending.await.unwrap().is_confirmed());
    assert_cached_tally(&s.cache, &id, VoteTally::new(21, Some(VoteDirection::Up)));
}

#[tokio::test]
async fn test_failed_vote_after_refetch_restores_fresh_count() {
    let api = MockVoteApi::new().with_reply(Err(server_error()));
    let s = setup(api, VoteTally::new(5, None));
    let id = ProjectId::new("abc");
    let refetched = VoteTally::new(20, Some(VoteDirection::Down));
    s.cache
        .set_data(
            keys::project(&id),
            fixtures::cached_project("abc", 20, Some(VoteDirection::Down)),
        )
        .unwrap();

    let outcome = s.controller.submit(VoteDirection::Up).await;

    assert!(matches!(outcome, SubmitOutcome::RolledBack { restored, .. } if restored == refetched));
    assert_eq!(s.controller.tally(), refetched);
    assert_cached_tally(&s.cache, &id, refetched);
}

proptest! {
    #[test]
    fn prop_rollback_restores_any_prior_tally(
        before in arb_vote_tally(),
        direction in arb_vote_direction(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let restored = runtime.block_on(async {
            let api = MockVoteApi::new().with_reply(Err(server_error()));
            let s = setup(api, before);
            s.controller.submit(direction).await;
            (s.controller.tally(), s.cache.get_data(&keys::project(&ProjectId::new("abc"))).unwrap())
        });
        prop_assert_eq!(restored.0, before);
        let cached = restored.1.and_then(|p| ship_core::read_vote_tally(&p));
        prop_assert_eq!(cached, Some(before));
    }
}
