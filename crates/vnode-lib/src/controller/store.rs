//! Last known biz state per module key

use crate::models::{ArkBizInfo, BizState};
use crate::translate::identity_of;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Observed info plus the instant its current state was first seen
#[derive(Debug, Clone, PartialEq)]
pub struct BizRecord {
    pub info: ArkBizInfo,
    pub since: DateTime<Utc>,
}

/// Result of applying one observation
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Unchanged,
    Changed { previous: Option<BizState> },
}

/// Concurrent map from `"<name>:<version>"` to the last observed record.
///
/// Writers lock one shard entry at a time, so updates to the same key are
/// applied one after another and readers always see whole records.
#[derive(Debug, Clone, Default)]
pub struct BizStateStore {
    records: Arc<DashMap<String, BizRecord>>,
}

impl BizStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation. `since` only moves when the state changes.
    pub fn apply(&self, info: ArkBizInfo, now: DateTime<Utc>) -> StateChange {
        match self.records.entry(identity_of(&info)) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.info.state == info.state {
                    record.info = info;
                    StateChange::Unchanged
                } else {
                    let previous = std::mem::replace(&mut record.info, info).state;
                    record.since = now;
                    StateChange::Changed {
                        previous: Some(previous),
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(BizRecord { info, since: now });
                StateChange::Changed { previous: None }
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<BizRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    pub fn remove(&self, key: &str) -> Option<BizRecord> {
        self.records.remove(key).map(|(_, record)| record)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn info(state: BizState) -> ArkBizInfo {
        ArkBizInfo::new("biz", "1.0.0", state)
    }

    #[test]
    fn test_first_observation_is_a_change() {
        let store = BizStateStore::new();
        let now = Utc::now();

        assert_eq!(
            store.apply(info(BizState::Resolved), now),
            StateChange::Changed { previous: None }
        );
        assert_eq!(store.get("biz:1.0.0").unwrap().since, now);
    }

    #[test]
    fn test_since_is_first_observation_of_state() {
        let store = BizStateStore::new();
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        let t2 = t0 + Duration::seconds(10);

        store.apply(info(BizState::Activated), t0);
        assert_eq!(
            store.apply(info(BizState::Activated), t1),
            StateChange::Unchanged
        );
        assert_eq!(store.get("biz:1.0.0").unwrap().since, t0);

        assert_eq!(
            store.apply(info(BizState::Deactivated), t2),
            StateChange::Changed {
                previous: Some(BizState::Activated)
            }
        );
        let record = store.get("biz:1.0.0").unwrap();
        assert_eq!(record.since, t2);
        assert_eq!(record.info.state, BizState::Deactivated);
    }

    #[test]
    fn test_unchanged_state_refreshes_details() {
        let store = BizStateStore::new();
        let now = Utc::now();
        store.apply(info(BizState::Activated), now);

        let mut updated = info(BizState::Activated);
        updated.web_context_path = "/biz".to_string();
        store.apply(updated, now);

        assert_eq!(store.get("biz:1.0.0").unwrap().info.web_context_path, "/biz");
    }

    #[test]
    fn test_remove() {
        let store = BizStateStore::new();
        store.apply(info(BizState::Activated), Utc::now());
        assert_eq!(store.len(), 1);

        assert!(store.remove("biz:1.0.0").is_some());
        assert!(store.is_empty());
        assert!(store.get("biz:1.0.0").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let store = BizStateStore::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.apply(
                        ArkBizInfo::new(format!("biz-{}", i), "1.0.0", BizState::Activated),
                        Utc::now(),
                    );
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len(), 8);
    }
}
