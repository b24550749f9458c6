//! Boundaries to the collaborators the engine drives but does not implement:
//! source-specific scrapers, watch streams, dependency lookups and storage.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::database::repositories::UpsertOutcome;
use crate::domain::{DeleteReason, ObjectRef, Resource, ScrapeSource, WatchKind};
use crate::watch::queue::QueueSender;

/// Result of a full scrape.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOutput {
    pub resources: Vec<Resource>,
    /// Resources the scraper saw flagged as deleted.
    pub deleted: Vec<Resource>,
    /// Non-fatal per-resource errors.
    pub errors: Vec<String>,
}

/// Performs a full scan of one source.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, source: &ScrapeSource, cancel: &CancellationToken) -> Result<ScrapeOutput>;
}

/// Streams resource mutations into a queue.
///
/// `watch` runs until the stream fails or `cancel` fires; the supervisor
/// restarts it on failure.
#[async_trait]
pub trait ResourceWatcher: Send + Sync {
    async fn watch(
        &self,
        source: &ScrapeSource,
        kind: &WatchKind,
        queue: QueueSender,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Materializes referenced objects. May return fewer than asked for.
#[async_trait]
pub trait DependencyResolver: Send + Sync {
    async fn resolve(&self, source: &ScrapeSource, refs: &[ObjectRef]) -> Result<Vec<Resource>>;
}

/// A batch handed to the persistence boundary.
#[derive(Debug, Clone)]
pub struct SaveBatch {
    pub upserts: Vec<Resource>,
    pub deletes: Vec<Resource>,
    pub delete_reason: DeleteReason,
}

impl SaveBatch {
    pub fn new(upserts: Vec<Resource>, deletes: Vec<Resource>, delete_reason: DeleteReason) -> Self {
        Self {
            upserts,
            deletes,
            delete_reason,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }
}

/// Outcome for one upserted resource.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub id: String,
    pub result: std::result::Result<UpsertOutcome, String>,
}

impl ItemOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-kind counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSummary {
    pub added: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

/// Aggregate counts of one save.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveSummary {
    pub kinds: BTreeMap<String, KindSummary>,
    pub changes_new: u64,
    pub changes_deduped: u64,
    pub changes_rate_limited: u64,
    /// Observation objects folded into changes of the object they describe.
    pub observations: u64,
    pub deleted: u64,
}

impl SaveSummary {
    pub fn record(&mut self, kind: &str, outcome: Option<UpsertOutcome>) {
        let entry = self.kinds.entry(kind.to_string()).or_default();
        match outcome {
            Some(UpsertOutcome::Created) => entry.added += 1,
            Some(UpsertOutcome::Updated) => entry.updated += 1,
            Some(UpsertOutcome::Unchanged) => entry.unchanged += 1,
            None => entry.failed += 1,
        }
    }

    pub fn merge(&mut self, other: &SaveSummary) {
        for (kind, s) in &other.kinds {
            let entry = self.kinds.entry(kind.clone()).or_default();
            entry.added += s.added;
            entry.updated += s.updated;
            entry.unchanged += s.unchanged;
            entry.failed += s.failed;
        }
        self.changes_new += other.changes_new;
        self.changes_deduped += other.changes_deduped;
        self.changes_rate_limited += other.changes_rate_limited;
        self.observations += other.observations;
        self.deleted += other.deleted;
    }
}

/// What the persistence boundary reports back.
#[derive(Debug, Clone, Default)]
pub struct SaveResult {
    pub items: Vec<ItemOutcome>,
    /// Errors not tied to a single upsert (e.g. the delete batch).
    pub errors: Vec<String>,
    pub summary: SaveSummary,
}

impl SaveResult {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// Persistence boundary. May partially fail; never assumed atomic.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, source: &ScrapeSource, batch: SaveBatch) -> Result<SaveResult>;
}

/// Collaborators available for one source type.
#[derive(Clone, Default)]
pub struct ScraperSet {
    pub scraper: Option<Arc<dyn Scraper>>,
    pub watcher: Option<Arc<dyn ResourceWatcher>>,
    pub resolver: Option<Arc<dyn DependencyResolver>>,
}

/// Lookup of collaborators by source type.
#[derive(Clone, Default)]
pub struct ScraperRegistry {
    by_type: HashMap<String, ScraperSet>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scraper(mut self, source_type: &str, scraper: Arc<dyn Scraper>) -> Self {
        self.by_type.entry(source_type.to_string()).or_default().scraper = Some(scraper);
        self
    }

    pub fn with_watcher(mut self, source_type: &str, watcher: Arc<dyn ResourceWatcher>) -> Self {
        self.by_type.entry(source_type.to_string()).or_default().watcher = Some(watcher);
        self
    }

    pub fn with_resolver(mut self, source_type: &str, resolver: Arc<dyn DependencyResolver>) -> Self {
        self.by_type.entry(source_type.to_string()).or_default().resolver = Some(resolver);
        self
    }

    pub fn get(&self, source_type: &str) -> Option<&ScraperSet> {
        self.by_type.get(source_type)
    }
}
