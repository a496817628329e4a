//! Optimistic bookmarking.

use serde_json::Value;
use ship_cache::QueryCache;
use ship_core::{keys, ProjectId};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::{MutationPhase, MutationRecord, SubmitOutcome};
use crate::api_client::SaveApi;
use crate::notifications::{Notification, Notifier};

#[derive(Debug)]
struct SaveState {
    saved: bool,
    phase: MutationPhase,
    last: Option<MutationRecord<bool>>,
}

/// Saved flag of one project for the signed-in user.
pub struct SaveController {
    project_id: ProjectId,
    api: Arc<dyn SaveApi>,
    cache: QueryCache,
    notifier: Notifier,
    state: Mutex<SaveState>,
}

impl SaveController {
    /// Start from the cached `saved-check` flag, or unsaved when absent.
    pub fn new(project_id: ProjectId, api: Arc<dyn SaveApi>, cache: QueryCache, notifier: Notifier) -> Self {
        let saved = cached_flag(&cache, &project_id).unwrap_or(false);
        Self {
            project_id,
            api,
            cache,
            notifier,
            state: Mutex::new(SaveState {
                saved,
                phase: MutationPhase::Idle,
                last: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SaveState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_saved(&self) -> bool {
        self.lock().saved
    }

    pub fn phase(&self) -> MutationPhase {
        self.lock().phase
    }

    pub fn last_mutation(&self) -> Option<MutationRecord<bool>> {
        self.lock().last.clone()
    }

    /// Flip the saved flag, starting from the cached value when present.
    pub async fn toggle(&self) -> SubmitOutcome<bool> {
        let displayed = cached_flag(&self.cache, &self.project_id);
        let target = {
            let mut state = self.lock();
            if state.phase == MutationPhase::Pending {
                debug!(project = %self.project_id, "Save already pending; ignoring");
                return SubmitOutcome::Ignored;
            }
            if let Some(displayed) = displayed {
                state.saved = displayed;
            }
            let target = !state.saved;
            state.last = Some(MutationRecord::pending(state.saved, target));
            state.saved = target;
            state.phase = MutationPhase::Pending;
            target
        };
        self.write_cache(target);

        let result = if target {
            self.api.save_project(&self.project_id).await
        } else {
            self.api.unsave_project(&self.project_id).await
        };

        let outcome = {
            let mut state = self.lock();
            let mut record = state
                .last
                .take()
                .unwrap_or_else(|| MutationRecord::pending(!target, target));
            let outcome = match result {
                Ok(()) => SubmitOutcome::Confirmed(record.confirm(target)),
                Err(error) => SubmitOutcome::RolledBack {
                    restored: record.roll_back(),
                    error,
                },
            };
            state.saved = match &outcome {
                SubmitOutcome::RolledBack { restored, .. } => *restored,
                _ => target,
            };
            state.last = Some(record);
            state.phase = MutationPhase::Idle;
            outcome
        };

        match &outcome {
            SubmitOutcome::Confirmed(_) => {
                for key in [keys::saved_projects(), keys::saved_check(&self.project_id)] {
                    if let Err(err) = self.cache.invalidate(&key) {
                        warn!(key = %key, error = %err, "Invalidation after save failed");
                    }
                }
                let message = if target {
                    "Saved to bookmarks!"
                } else {
                    "Removed from saved"
                };
                self.notifier.notify(Notification::success(message));
            }
            SubmitOutcome::RolledBack { restored, error } => {
                self.write_cache(*restored);
                warn!(project = %self.project_id, error = %error, "Save toggle failed; rolled back");
                let fallback = if target {
                    "Failed to save project"
                } else {
                    "Failed to unsave project"
                };
                let message = error.server_message().unwrap_or(fallback);
                self.notifier.notify(Notification::error(message));
            }
            SubmitOutcome::Ignored => {}
        }
        outcome
    }

    fn write_cache(&self, saved: bool) {
        let key = keys::saved_check(&self.project_id);
        if let Err(err) = self.cache.set_data(key.clone(), Value::Bool(saved)) {
            warn!(key = %key, error = %err, "Failed to write saved flag");
        }
    }
}

fn cached_flag(cache: &QueryCache, project_id: &ProjectId) -> Option<bool> {
    cache.get_as::<bool>(&keys::saved_check(project_id)).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiClientError;
    use async_trait::async_trait;
    use ship_cache::CacheConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakySaves {
        fail: AtomicBool,
    }

    #[async_trait]
    impl SaveApi for FlakySaves {
        async fn save_project(&self, _project_id: &ProjectId) -> Result<(), ApiClientError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ApiClientError::Status {
                    status: 400,
                    message: Some("Project already saved".into()),
                });
            }
            Ok(())
        }

        async fn unsave_project(&self, _project_id: &ProjectId) -> Result<(), ApiClientError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ApiClientError::Status {
                    status: 404,
                    message: None,
                });
            }
            Ok(())
        }
    }

    fn setup(fail: bool) -> (SaveController, QueryCache, tokio::sync::mpsc::Receiver<Notification>) {
        let cache = QueryCache::new(CacheConfig::default());
        let (notifier, rx) = Notifier::channel(8);
        let api = Arc::new(FlakySaves {
            fail: AtomicBool::new(fail),
        });
        let controller = SaveController::new(ProjectId::new("p1"), api, cache.clone(), notifier);
        (controller, cache, rx)
    }

    #[tokio::test]
    async fn test_save_then_unsave() {
        let (controller, cache, mut rx) = setup(false);
        assert!(!controller.is_saved());

        assert!(controller.toggle().await.is_confirmed());
        assert!(controller.is_saved());
        assert_eq!(
            cache.get_data(&keys::saved_check(&ProjectId::new("p1"))).unwrap(),
            Some(Value::Bool(true))
        );
        assert_eq!(rx.try_recv().unwrap().message, "Saved to bookmarks!");

        assert!(controller.toggle().await.is_confirmed());
        assert!(!controller.is_saved());
        assert_eq!(rx.try_recv().unwrap().message, "Removed from saved");
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back() {
        let (controller, cache, mut rx) = setup(true);
        let outcome = controller.toggle().await;
        assert!(matches!(outcome, SubmitOutcome::RolledBack { restored: false, .. }));
        assert!(!controller.is_saved());
        assert_eq!(
            cache.get_data(&keys::saved_check(&ProjectId::new("p1"))).unwrap(),
            Some(Value::Bool(false))
        );
        assert_eq!(rx.try_recv().unwrap().message, "Project already saved");
        assert_eq!(
            controller.last_mutation().unwrap().phase,
            MutationPhase::RolledBack
        );
    }

    #[tokio::test]
    async fn test_toggle_starts_from_refetched_flag() {
        let (controller, cache, mut rx) = setup(false);
        let key = keys::saved_check(&ProjectId::new("p1"));
        cache.set_data(key.clone(), Value::Bool(true)).unwrap();

        let outcome = controller.toggle().await;
        assert!(matches!(outcome, SubmitOutcome::Confirmed(false)));
        assert!(!controller.is_saved());
        assert_eq!(rx.try_recv().unwrap().message, "Removed from saved");
    }

    #[tokio::test]
    async fn test_rollback_restores_refetched_flag() {
        let (controller, cache, _rx) = setup(true);
        let key = keys::saved_check(&ProjectId::new("p1"));
        cache.set_data(key.clone(), Value::Bool(true)).unwrap();

        let outcome = controller.toggle().await;
        assert!(matches!(outcome, SubmitOutcome::RolledBack { restored: true, .. }));
        assert!(controller.is_saved());
        assert_eq!(cache.get_data(&key).unwrap(), Some(Value::Bool(true)));
    }
}
