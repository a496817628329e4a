//! Startup cache warmup.

use futures_util::future::join_all;
use ship_cache::QueryCache;
use ship_core::{keys, QueryKey};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::PrefetchConfig;

/// One key to load and how long its data stays fresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchTarget {
    pub key: QueryKey,
    pub stale_time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    pub succeeded: usize,
    pub failed: Vec<QueryKey>,
    pub elapsed: Duration,
}

impl WarmupReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed.len()
    }
}

/// The keys warmed at startup, in issue order.
pub fn targets(config: &PrefetchConfig, authenticated: bool) -> Vec<PrefetchTarget> {
    let target = |key, stale_time| PrefetchTarget { key, stale_time };
    let limit = config.leaderboard_limit;
    let mut targets = vec![
        target(keys::feed("hot", 1), config.feed_stale()),
        target(keys::feed("hot", 2), config.feed_stale()),
        target(keys::feed("new", 1), config.feed_stale()),
        target(keys::feed("top", 1), config.feed_stale()),
        target(keys::leaderboard_projects(limit), config.leaderboard_stale()),
        target(keys::leaderboard_builders(limit), config.leaderboard_stale()),
    ];
    if authenticated {
        targets.push(target(keys::intros_received(), config.intros_stale()));
        targets.push(target(keys::intros_sent(), config.intros_stale()));
        targets.push(target(keys::conversations(), config.conversations_stale()));
    }
    targets
}

/// Load the startup keys in parallel through the cache's fetcher.
///
/// Every prefetch runs to completion regardless of the others; failures are
/// logged and counted, never raised.
pub async fn warm_up(cache: &QueryCache, authenticated: bool, config: &PrefetchConfig) -> WarmupReport {
    if !config.enabled {
        return WarmupReport::default();
    }
    let started = Instant::now();
    let targets = targets(config, authenticated);
    let results = join_all(targets.iter().map(|t| cache.prefetch(&t.key, t.stale_time))).await;

    let mut report = WarmupReport::default();
    for (target, result) in targets.into_iter().zip(results) {
        match result {
            Ok(()) => report.succeeded += 1,
            Err(err) => {
                warn!(key = %target.key, error = %err, "Prefetch failed");
                report.failed.push(target.key);
            }
        }
    }
    report.elapsed = started.elapsed();
    info!(
        succeeded = report.succeeded,
        failed = report.failed.len(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Cache warmup finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_targets() {
        let targets = targets(&PrefetchConfig::default(), false);
        assert_eq!(targets.len(), 6);
        assert_eq!(targets[0].key, keys::feed("hot", 1));
        assert_eq!(targets[0].stale_time, Duration::from_secs(15 * 60));
        assert_eq!(targets[5].key, keys::leaderboard_builders(50));
    }

    #[test]
    fn test_authenticated_targets() {
        let targets = targets(&PrefetchConfig::default(), true);
        assert_eq!(targets.len(), 9);
        let conversations = targets.last().unwrap();
        assert_eq!(conversations.key, keys::conversations());
        assert_eq!(conversations.stale_time, Duration::from_secs(30));
        assert_eq!(targets[6].stale_time, Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_disabled_warmup_does_nothing() {
        let cache = QueryCache::new(ship_cache::CacheConfig::default());
        let config = PrefetchConfig {
            enabled: false,
            ..PrefetchConfig::default()
        };
        let report = warm_up(&cache, true, &config).await;
        assert_eq!(report.attempted(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_raised() {
        // No fetcher installed: every prefetch fails independently.
        let cache = QueryCache::new(ship_cache::CacheConfig::default());
        let report = warm_up(&cache, false, &PrefetchConfig::default()).await;
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed.len(), 6);
    }
}
