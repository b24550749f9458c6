//! Metrics collector implementation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Upper bounds of the time-in-queue histogram.
pub const CONSUME_LAG_BUCKETS: [Duration; 8] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(120),
    Duration::from_secs(300),
    Duration::from_secs(600),
    Duration::from_secs(900),
    Duration::from_secs(1800),
];

/// Per-source counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCounter {
    QueueConsumed,
    ItemsSaved,
    ItemsFailed,
    ItemsDeleted,
    Redeliveries,
    RedeliveriesDropped,
    EnqueueDropped,
    DependenciesRequested,
    DependenciesResolved,
    ChangesNew,
    ChangesDeduped,
    ChangesRateLimited,
    StaleMarked,
    StaleRevived,
    JobsRun,
    JobsSkipped,
    JobsFailed,
}

impl SourceCounter {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueConsumed => "queue_consumed",
            Self::ItemsSaved => "items_saved",
            Self::ItemsFailed => "items_failed",
            Self::ItemsDeleted => "items_deleted",
            Self::Redeliveries => "redeliveries",
            Self::RedeliveriesDropped => "redeliveries_dropped",
            Self::EnqueueDropped => "enqueue_dropped",
            Self::DependenciesRequested => "dependencies_requested",
            Self::DependenciesResolved => "dependencies_resolved",
            Self::ChangesNew => "changes_new",
            Self::ChangesDeduped => "changes_deduped",
            Self::ChangesRateLimited => "changes_rate_limited",
            Self::StaleMarked => "stale_marked",
            Self::StaleRevived => "stale_revived",
            Self::JobsRun => "jobs_run",
            Self::JobsSkipped => "jobs_skipped",
            Self::JobsFailed => "jobs_failed",
        }
    }
}

#[derive(Debug, Default)]
struct LagHistogram {
    buckets: [AtomicU64; CONSUME_LAG_BUCKETS.len()],
    count: AtomicU64,
    sum_ms: AtomicU64,
}

impl LagHistogram {
    fn observe(&self, lag: Duration) {
        for (bound, bucket) in CONSUME_LAG_BUCKETS.iter().zip(&self.buckets) {
            if lag <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_ms
            .fetch_add(lag.as_millis() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LagHistogramSnapshot {
        LagHistogramSnapshot {
            cumulative: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count: self.count.load(Ordering::Relaxed),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

/// Metrics collector for the scrape engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    counters: DashMap<(String, SourceCounter), AtomicU64>,
    consume_lag: DashMap<String, LagHistogram>,
    queue_depth: DashMap<String, AtomicU64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, source_id: &str, counter: SourceCounter) {
        self.add(source_id, counter, 1);
    }

    pub fn add(&self, source_id: &str, counter: SourceCounter, n: u64) {
        if n == 0 {
            return;
        }
        self.counters
            .entry((source_id.to_string(), counter))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, source_id: &str, counter: SourceCounter) -> u64 {
        self.counters
            .get(&(source_id.to_string(), counter))
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Time an item spent between enqueue and consumption.
    pub fn observe_consume_lag(&self, source_id: &str, lag: Duration) {
        self.consume_lag
            .entry(source_id.to_string())
            .or_default()
            .observe(lag);
    }

    pub fn set_queue_depth(&self, source_id: &str, depth: usize) {
        self.queue_depth
            .entry(source_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(depth as u64, Ordering::Relaxed);
    }

    /// Forget everything about a removed source.
    pub fn remove_source(&self, source_id: &str) {
        self.counters.retain(|(id, _), _| id != source_id);
        self.consume_lag.remove(source_id);
        self.queue_depth.remove(source_id);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: BTreeMap<String, BTreeMap<SourceCounter, u64>> = BTreeMap::new();
        for entry in self.counters.iter() {
            let (source_id, counter) = entry.key();
            counters
                .entry(source_id.clone())
                .or_default()
                .insert(*counter, entry.value().load(Ordering::Relaxed));
        }

        MetricsSnapshot {
            counters,
            consume_lag: self
                .consume_lag
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
            queue_depth: self
                .queue_depth
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// Histogram state; `cumulative[i]` counts observations `<= CONSUME_LAG_BUCKETS[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagHistogramSnapshot {
    pub cumulative: Vec<u64>,
    pub count: u64,
    pub sum_ms: u64,
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, BTreeMap<SourceCounter, u64>>,
    pub consume_lag: BTreeMap<String, LagHistogramSnapshot>,
    pub queue_depth: BTreeMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_source() {
        let metrics = EngineMetrics::new();
        metrics.incr("s1", SourceCounter::ItemsSaved);
        metrics.add("s1", SourceCounter::ItemsSaved, 2);
        metrics.incr("s2", SourceCounter::ItemsFailed);

        assert_eq!(metrics.get("s1", SourceCounter::ItemsSaved), 3);
        assert_eq!(metrics.get("s2", SourceCounter::ItemsSaved), 0);
        assert_eq!(metrics.get("s2", SourceCounter::ItemsFailed), 1);

        metrics.remove_source("s1");
        assert_eq!(metrics.get("s1", SourceCounter::ItemsSaved), 0);
    }

    #[test]
    fn test_lag_histogram_is_cumulative() {
        let metrics = EngineMetrics::new();
        metrics.observe_consume_lag("s1", Duration::from_millis(500));
        metrics.observe_consume_lag("s1", Duration::from_secs(45));
        metrics.observe_consume_lag("s1", Duration::from_secs(3600));

        let snapshot = metrics.snapshot();
        let lag = &snapshot.consume_lag["s1"];
        assert_eq!(lag.count, 3);
        assert_eq!(lag.cumulative[0], 1); // <= 1s
        assert_eq!(lag.cumulative[2], 1); // <= 30s
        assert_eq!(lag.cumulative[3], 2); // <= 2m
        assert_eq!(lag.cumulative[7], 2); // <= 30m
    }
}
