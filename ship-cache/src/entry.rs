//! Cache entries and the read snapshot handed to callers.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::Value;
use ship_core::{QueryKey, Timestamp};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    /// Data matches the last completed fetch and nothing has invalidated it.
    Fresh,
    /// Invalidated or failed; the next read should refetch.
    Stale,
    /// A fetch is in flight.
    Fetching,
}

/// Point-in-time copy of one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<Value>,
    pub status: EntryStatus,
    pub last_updated: Option<Timestamp>,
}

impl CacheEntry {
    /// How long ago the data was written, if it ever was.
    pub fn age(&self) -> Option<Duration> {
        self.last_updated.map(|at| {
            Utc::now()
                .signed_duration_since(at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// True if the entry is `Fresh` and was written within `stale_time`.
    pub fn is_fresh_within(&self, stale_time: Duration) -> bool {
        self.status == EntryStatus::Fresh
            && self.data.is_some()
            && self.age().is_some_and(|age| age <= stale_time)
    }

    /// Deserialize the data into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> CacheResult<Option<T>> {
        match &self.data {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| CacheError::Decode {
                    key: self.key.clone(),
                    reason: e.to_string(),
                }),
        }
    }
}

/// Internal mutable state of one entry.
#[derive(Debug)]
pub(crate) struct Slot {
    /// Identity of this entry; a new serial is assigned when a key is
    /// recreated after eviction.
    pub serial: u64,
    /// Bumped by every invalidation.
    pub generation: u64,
    pub data: Option<Value>,
    pub status: EntryStatus,
    pub last_updated: Option<Timestamp>,
    pub in_flight: bool,
    /// An invalidation arrived while a fetch was in flight.
    pub refetch_queued: bool,
}

impl Slot {
    pub fn empty(serial: u64) -> Self {
        Self {
            serial,
            generation: 0,
            data: None,
            status: EntryStatus::Stale,
            last_updated: None,
            in_flight: false,
            refetch_queued: false,
        }
    }

    pub fn with_data(serial: u64, data: Value) -> Self {
        Self {
            data: Some(data),
            status: EntryStatus::Fresh,
            last_updated: Some(Utc::now()),
            ..Self::empty(serial)
        }
    }

    pub fn write(&mut self, data: Value) {
        self.data = Some(data);
        self.last_updated = Some(Utc::now());
    }

    pub fn snapshot(&self, key: &QueryKey) -> CacheEntry {
        CacheEntry {
            key: key.clone(),
            data: self.data.clone(),
            status: self.status,
            last_updated: self.last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ship_core::keys;

    #[test]
    fn test_fresh_within_requires_data_and_fresh_status() {
        let key = keys::projects();
        let mut slot = Slot::with_data(1, json!([1]));
        assert!(slot.snapshot(&key).is_fresh_within(Duration::from_secs(60)));

        slot.status = EntryStatus::Stale;
        assert!(!slot.snapshot(&key).is_fresh_within(Duration::from_secs(60)));

        let empty = Slot::empty(2);
        assert!(!empty.snapshot(&key).is_fresh_within(Duration::from_secs(60)));
    }

    #[test]
    fn test_old_entry_is_not_fresh() {
        let key = keys::projects();
        let mut slot = Slot::with_data(1, json!([]));
        slot.last_updated = Some(Utc::now() - chrono::Duration::minutes(20));
        let entry = slot.snapshot(&key);
        assert!(!entry.is_fresh_within(Duration::from_secs(15 * 60)));
        assert!(entry.age().unwrap() >= Duration::from_secs(20 * 60 - 1));
    }

    #[test]
    fn test_decode_reports_key() {
        let slot = Slot::with_data(1, json!("not a number"));
        let err = slot
            .snapshot(&keys::saved_projects())
            .decode::<i64>()
            .unwrap_err();
        assert!(matches!(err, CacheError::Decode { .. }));
    }
}
