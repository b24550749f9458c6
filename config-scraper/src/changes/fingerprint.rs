//! Change fingerprint dedup cache.
//!
//! Repeated changes of the same kind on the same resource collapse into one
//! persisted row with a running count while the first occurrence is younger
//! than the dedup window. The key is `(resource id, change kind)`, never the
//! payload, so a flapping value with different content each time still
//! collapses.
//!
//! Each key has its own async lock; the map itself is only touched to find
//! or create that lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::database::repositories::ChangeRepository;
use crate::domain::{ChangeRecord, ObservedChange};
use crate::{Error, Result};

type Key = (String, String);

#[derive(Debug, Clone)]
struct Entry {
    first_seen: DateTime<Utc>,
    count: i64,
    row_id: String,
    window: chrono::Duration,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        now - self.first_seen < window
    }
}

/// Outcome of [`ChangeFingerprintCache::record_change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChange {
    /// A new row was written.
    pub is_new: bool,
    pub row_id: String,
    /// Observations now folded into the row.
    pub count: i64,
}

fn to_chrono(window: Duration) -> chrono::Duration {
    chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX)
}

pub struct ChangeFingerprintCache {
    entries: DashMap<Key, Arc<Mutex<Option<Entry>>>>,
    /// Window lengths (in ms) already loaded from the repository.
    bootstrapped: DashMap<i64, Arc<OnceCell<()>>>,
    repo: Arc<dyn ChangeRepository>,
    clock: SharedClock,
}

impl ChangeFingerprintCache {
    pub fn new(repo: Arc<dyn ChangeRepository>, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            bootstrapped: DashMap::new(),
            repo,
            clock,
        }
    }

    /// Record one observation of `change_kind` on `resource_id`.
    pub async fn record_change(
        &self,
        resource_id: &str,
        change_kind: &str,
        payload: &ObservedChange,
        window: Duration,
    ) -> Result<RecordedChange> {
        let window = to_chrono(window);
        self.bootstrap(window).await?;

        let slot = self
            .entries
            .entry((resource_id.to_string(), change_kind.to_string()))
            .or_default()
            .clone();
        let mut entry = slot.lock().await;
        let now = self.clock.now();

        if let Some(live) = entry.as_mut().filter(|e| e.is_live(now, window)) {
            match self
                .repo
                .bump(&live.row_id, &payload.details, payload.summary.as_deref(), now)
                .await
            {
                Ok(count) => {
                    live.count = count;
                    return Ok(RecordedChange {
                        is_new: false,
                        row_id: live.row_id.clone(),
                        count,
                    });
                }
                // Row removed behind our back; start a fresh one.
                Err(Error::NotFound { .. }) => {
                    debug!(resource_id, change_kind, "Collapsed change row vanished");
                }
                Err(e) => return Err(e),
            }
        }

        let row = ChangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            config_id: resource_id.to_string(),
            change_type: change_kind.to_string(),
            summary: payload.summary.clone(),
            details: payload.details.clone(),
            count: 1,
            first_observed: now,
            last_observed: now,
        };
        self.repo.insert(&row).await?;

        *entry = Some(Entry {
            first_seen: now,
            count: 1,
            row_id: row.id.clone(),
            window,
        });

        Ok(RecordedChange {
            is_new: true,
            row_id: row.id,
            count: 1,
        })
    }

    /// Whether a repeat of `change_kind` on `resource_id` would collapse right now.
    ///
    /// Advisory only: a concurrent writer may change the answer.
    pub fn would_collapse(&self, resource_id: &str, change_kind: &str, window: Duration) -> bool {
        let window = to_chrono(window);
        let now = self.clock.now();
        let Some(slot) = self
            .entries
            .get(&(resource_id.to_string(), change_kind.to_string()))
            .map(|s| s.clone())
        else {
            return false;
        };
        slot.try_lock()
            .map(|e| e.as_ref().is_some_and(|e| e.is_live(now, window)))
            .unwrap_or(false)
    }

    /// Load rows still inside `window` the first time that window is used.
    async fn bootstrap(&self, window: chrono::Duration) -> Result<()> {
        let cell = self
            .bootstrapped
            .entry(window.num_milliseconds())
            .or_default()
            .clone();

        cell.get_or_try_init(|| async {
            let since = self
                .clock
                .now()
                .checked_sub_signed(window)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let rows = self.repo.list_since(since).await?;
            let mut loaded = 0usize;
            for row in rows {
                let slot = self
                    .entries
                    .entry((row.config_id.clone(), row.change_type.clone()))
                    .or_default()
                    .clone();
                let mut entry = slot.lock().await;
                let newer = entry
                    .as_ref()
                    .is_none_or(|e| row.first_observed > e.first_seen);
                if newer {
                    *entry = Some(Entry {
                        first_seen: row.first_observed,
                        count: row.count,
                        row_id: row.id,
                        window,
                    });
                    loaded += 1;
                }
            }
            info!(window_ms = window.num_milliseconds(), loaded, "Change fingerprint cache bootstrapped");
            Ok::<(), Error>(())
        })
        .await?;
        Ok(())
    }

    /// Evict entries whose window has passed. Entries in use are skipped.
    ///
    /// A slot is in use while any caller holds a handle to it, locked or not;
    /// evicting it then would let the next caller create a second slot for
    /// the same key.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(entry) => entry.as_ref().is_some_and(|e| e.is_live(now, e.window)),
                Err(_) => true,
            }
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Evicted expired change fingerprints");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current count for a key, if it has a live entry.
    pub async fn count(&self, resource_id: &str, change_kind: &str) -> Option<i64> {
        let slot = self
            .entries
            .get(&(resource_id.to_string(), change_kind.to_string()))
            .map(|s| s.clone())?;
        let entry = slot.lock().await;
        entry.as_ref().map(|e| e.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::memory_pool;
    use crate::database::repositories::SqlxChangeRepository;
    use serde_json::json;

    const HOUR: Duration = Duration::from_secs(3600);

    async fn cache_with_clock() -> (ChangeFingerprintCache, Arc<SqlxChangeRepository>, Arc<ManualClock>) {
        let pool = memory_pool().await.unwrap();
        let repo = Arc::new(SqlxChangeRepository::new(pool));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = ChangeFingerprintCache::new(repo.clone(), clock.clone());
        (cache, repo, clock)
    }

    fn diff(value: u32) -> ObservedChange {
        ObservedChange::new("diff", json!({"replicas": value}))
    }

    #[tokio::test]
    async fn test_repeats_collapse_into_one_row() {
        let (cache, repo, clock) = cache_with_clock().await;

        let first = cache.record_change("deploy-1", "diff", &diff(1), HOUR).await.unwrap();
        assert!(first.is_new);
        for n in 2..=5 {
            clock.advance(Duration::from_secs(60));
            let again = cache.record_change("deploy-1", "diff", &diff(n), HOUR).await.unwrap();
            assert!(!again.is_new);
            assert_eq!(again.row_id, first.row_id);
        }

        let rows = repo.list_for_config("deploy-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 5);
        assert_eq!(rows[0].details, json!({"replicas": 5}));
        assert_eq!(cache.count("deploy-1", "diff").await, Some(5));
    }

    #[tokio::test]
    async fn test_change_after_window_starts_new_row() {
        let (cache, repo, clock) = cache_with_clock().await;

        cache.record_change("deploy-1", "diff", &diff(1), HOUR).await.unwrap();
        cache.record_change("deploy-1", "diff", &diff(2), HOUR).await.unwrap();
        clock.advance(HOUR);
        let later = cache.record_change("deploy-1", "diff", &diff(3), HOUR).await.unwrap();
        assert!(later.is_new);
        assert_eq!(later.count, 1);

        let rows = repo.list_for_config("deploy-1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].count, 2);
        assert_eq!(rows[1].count, 1);
    }

    #[tokio::test]
    async fn test_kinds_and_resources_are_separate() {
        let (cache, repo, _clock) = cache_with_clock().await;
        cache.record_change("pod-1", "BackOff", &ObservedChange::new("BackOff", json!({})), HOUR).await.unwrap();
        cache.record_change("pod-1", "Pulled", &ObservedChange::new("Pulled", json!({})), HOUR).await.unwrap();
        cache.record_change("pod-2", "BackOff", &ObservedChange::new("BackOff", json!({})), HOUR).await.unwrap();

        assert_eq!(repo.list_for_config("pod-1").await.unwrap().len(), 2);
        assert_eq!(repo.list_for_config("pod-2").await.unwrap().len(), 1);
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test]
    async fn test_bootstrap_continues_persisted_rows() {
        let pool = memory_pool().await.unwrap();
        let repo = Arc::new(SqlxChangeRepository::new(pool));
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let before_restart = ChangeFingerprintCache::new(repo.clone(), clock.clone());
        let first = before_restart.record_change("deploy-1", "diff", &diff(1), HOUR).await.unwrap();
        drop(before_restart);

        clock.advance(Duration::from_secs(600));
        let after_restart = ChangeFingerprintCache::new(repo.clone(), clock.clone());
        let again = after_restart.record_change("deploy-1", "diff", &diff(2), HOUR).await.unwrap();
        assert!(!again.is_new);
        assert_eq!(again.row_id, first.row_id);
        assert_eq!(again.count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_first_occurrences_write_one_row() {
        let (cache, repo, _clock) = cache_with_clock().await;
        let cache = Arc::new(cache);

        let tasks: Vec<_> = (0..8)
            .map(|n| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache.record_change("deploy-1", "diff", &diff(n), HOUR).await.unwrap()
                })
            })
            .collect();
        let mut new_rows = 0;
        for task in tasks {
            if task.await.unwrap().is_new {
                new_rows += 1;
            }
        }

        assert_eq!(new_rows, 1);
        let rows = repo.list_for_config("deploy-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 8);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let (cache, _repo, clock) = cache_with_clock().await;
        cache.record_change("a", "diff", &diff(1), Duration::from_secs(60)).await.unwrap();
        cache.record_change("b", "diff", &diff(1), HOUR).await.unwrap();

        clock.advance(Duration::from_secs(120));
        assert!(!cache.would_collapse("a", "diff", Duration::from_secs(60)));
        assert!(cache.would_collapse("b", "diff", HOUR));
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_skips_slot_held_by_a_writer() {
        let (cache, _repo, clock) = cache_with_clock().await;
        cache.record_change("a", "diff", &diff(1), Duration::from_secs(60)).await.unwrap();
        clock.advance(Duration::from_secs(120));

        // A writer that has looked up the slot but not locked it yet.
        let held = cache
            .entries
            .get(&("a".to_string(), "diff".to_string()))
            .map(|s| s.clone())
            .unwrap();
        assert_eq!(cache.cleanup_expired(), 0);
        assert_eq!(cache.len(), 1);

        drop(held);
        assert_eq!(cache.cleanup_expired(), 1);
        assert!(cache.is_empty());
    }
}
