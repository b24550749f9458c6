//! Incremental queue consumer.
//!
//! One invocation drains a bounded batch from a source's [`WatchQueue`],
//! withholds observations whose referenced object is not known yet, keeps
//! only the latest version of each resource, asks the resolver for the
//! missing objects and hands the batch to the [`ResultSink`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::WatchQueue;
use super::resolved::ResolvedItems;
use crate::clock::SharedClock;
use crate::domain::{DeleteReason, ObjectRef, QueueItem, QueueOperation, Resource, RetryPolicy, ScrapeSource};
use crate::metrics::{EngineMetrics, SourceCounter};
use crate::scrapers::{DependencyResolver, ResultSink, SaveBatch, SaveSummary};
use crate::Result;

/// Below this share of resolved dependencies something is likely broken.
const LOW_RESOLUTION_RATIO: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound of items taken per invocation.
    pub drain_max: usize,
    /// How long an invocation waits for the first item.
    pub drain_wait: Duration,
    pub redelivery_delay: Duration,
    /// Redeliveries allowed per item before it is dropped.
    pub max_redeliveries: u32,
    pub dependency_retry: RetryPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            drain_max: 5_000,
            drain_wait: Duration::from_secs(1),
            redelivery_delay: Duration::from_secs(30),
            max_redeliveries: 5,
            dependency_retry: RetryPolicy::default(),
        }
    }
}

/// What one invocation did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsumeReport {
    pub drained: usize,
    pub upserts: usize,
    pub deletes: usize,
    pub withheld: usize,
    pub duplicates: usize,
    pub dependencies_requested: usize,
    pub dependencies_resolved: usize,
    pub saved: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub summary: SaveSummary,
}

/// Batches drained from the queue, split and filtered.
#[derive(Debug, Default)]
struct SplitBatch {
    upserts: Vec<QueueItem>,
    deletes: Vec<QueueItem>,
    withheld: Vec<QueueItem>,
    missing: Vec<ObjectRef>,
}

/// Consumer for one event-driven source.
pub struct IncrementalConsumer {
    source: Arc<ScrapeSource>,
    queue: Arc<WatchQueue>,
    /// `None` when the source type has no way to fetch missing objects.
    resolver: Option<Arc<dyn DependencyResolver>>,
    sink: Arc<dyn ResultSink>,
    resolved: Arc<ResolvedItems>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
    config: ConsumerConfig,
}

impl IncrementalConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<ScrapeSource>,
        queue: Arc<WatchQueue>,
        resolver: Option<Arc<dyn DependencyResolver>>,
        sink: Arc<dyn ResultSink>,
        resolved: Arc<ResolvedItems>,
        metrics: Arc<EngineMetrics>,
        clock: SharedClock,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            queue,
            resolver,
            sink,
            resolved,
            metrics,
            clock,
            config,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source.id
    }

    /// Run one invocation.
    ///
    /// Per-item save failures are reported, not raised. A failed save or an
    /// exhausted dependency fetch fails the invocation, the latter only after
    /// the batch has been saved.
    pub async fn consume(&self, cancel: &CancellationToken) -> Result<ConsumeReport> {
        let source_id = self.source.id.as_str();
        let drained = self
            .queue
            .drain(self.config.drain_max, self.config.drain_wait)
            .await;
        self.metrics.set_queue_depth(source_id, self.queue.len());

        let mut report = ConsumeReport {
            drained: drained.len(),
            ..Default::default()
        };
        if drained.is_empty() {
            return Ok(report);
        }

        let now = self.clock.now();
        for item in &drained {
            let lag = (now - item.enqueued_at).to_std().unwrap_or_default();
            self.metrics.observe_consume_lag(source_id, lag);
        }
        self.metrics
            .add(source_id, SourceCounter::QueueConsumed, drained.len() as u64);

        let split = self.split(drained);
        report.withheld = split.withheld.len();
        for item in split.withheld {
            self.schedule_redelivery(item);
        }

        let before = split.upserts.len();
        let upserts = latest_per_identity(split.upserts);
        report.duplicates = before - upserts.len();
        let deletes: Vec<Resource> = split.deletes.into_iter().map(|i| i.resource).collect();
        report.upserts = upserts.len();
        report.deletes = deletes.len();

        let dependency_error = match &self.resolver {
            Some(resolver) if !split.missing.is_empty() => self
                .fetch_dependencies(resolver.as_ref(), &split.missing, cancel, &mut report)
                .await
                .err(),
            _ => None,
        };

        let batch = SaveBatch::new(upserts, deletes, DeleteReason::DeleteEvent);
        if !batch.is_empty() {
            let kinds: HashMap<String, String> = batch
                .upserts
                .iter()
                .map(|r| (r.id.clone(), r.kind.clone()))
                .collect();
            let deleted_ids: Vec<String> = batch.deletes.iter().map(|r| r.id.clone()).collect();

            let result = self.sink.save(&self.source, batch).await?;

            for outcome in &result.items {
                match &outcome.result {
                    Ok(_) => {
                        self.resolved.set(outcome.id.clone());
                        report.saved += 1;
                    }
                    Err(e) => {
                        report.failed += 1;
                        debug!(
                            source_id,
                            resource_id = %outcome.id,
                            kind = kinds.get(&outcome.id).map(String::as_str).unwrap_or(""),
                            error = %e,
                            "Failed to save item"
                        );
                        report.errors.push(format!("{}: {e}", outcome.id));
                    }
                }
            }
            for id in &deleted_ids {
                self.resolved.remove(id);
            }
            report.errors.extend(result.errors.iter().cloned());

            self.metrics
                .add(source_id, SourceCounter::ItemsSaved, report.saved as u64);
            self.metrics
                .add(source_id, SourceCounter::ItemsFailed, report.failed as u64);
            self.metrics
                .add(source_id, SourceCounter::ItemsDeleted, result.summary.deleted);
            report.summary = result.summary;
        }

        debug!(
            source_id,
            drained = report.drained,
            upserts = report.upserts,
            deletes = report.deletes,
            withheld = report.withheld,
            saved = report.saved,
            failed = report.failed,
            "Consumed watch queue"
        );

        match dependency_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Split by operation and pull out observations of unknown objects.
    fn split(&self, drained: Vec<QueueItem>) -> SplitBatch {
        let in_batch: HashSet<String> = drained
            .iter()
            .filter(|i| i.operation != QueueOperation::Delete)
            .map(|i| i.resource.id.clone())
            .collect();

        let mut batch = SplitBatch::default();
        let mut missing_ids = HashSet::new();

        for item in drained {
            if item.operation == QueueOperation::Delete {
                batch.deletes.push(item);
                continue;
            }

            let unknown = item.resource.involved.as_ref().filter(|target| {
                !in_batch.contains(&target.id) && !self.resolved.get(&target.id)
            });

            match unknown {
                Some(target) => {
                    if missing_ids.insert(target.id.clone()) {
                        batch.missing.push(target.clone());
                    }
                    batch.withheld.push(item);
                }
                None => batch.upserts.push(item),
            }
        }
        batch
    }

    fn schedule_redelivery(&self, item: QueueItem) {
        if item.redeliveries >= self.config.max_redeliveries {
            self.metrics
                .incr(&self.source.id, SourceCounter::RedeliveriesDropped);
            warn!(
                source_id = %self.source.id,
                resource_id = %item.resource.id,
                redeliveries = item.redeliveries,
                "Dependency never resolved, dropping observation"
            );
            return;
        }
        self.queue
            .redeliver_later(item, self.config.redelivery_delay);
    }

    /// Fetch missing objects and queue them as ordinary upserts.
    async fn fetch_dependencies(
        &self,
        resolver: &dyn DependencyResolver,
        refs: &[ObjectRef],
        cancel: &CancellationToken,
        report: &mut ConsumeReport,
    ) -> Result<()> {
        let source_id = self.source.id.as_str();
        report.dependencies_requested = refs.len();
        self.metrics
            .add(source_id, SourceCounter::DependenciesRequested, refs.len() as u64);

        let resolved = self
            .config
            .dependency_retry
            .run("resolve_dependencies", cancel, || {
                resolver.resolve(&self.source, refs)
            })
            .await
            .inspect_err(|e| {
                warn!(source_id, requested = refs.len(), error = %e, "Dependency fetch failed");
            })?;

        report.dependencies_resolved = resolved.len();
        self.metrics
            .add(source_id, SourceCounter::DependenciesResolved, resolved.len() as u64);

        let ratio = resolved.len() as f64 / refs.len() as f64;
        if ratio < LOW_RESOLUTION_RATIO {
            warn!(
                source_id,
                requested = refs.len(),
                resolved = resolved.len(),
                "Low dependency resolution ratio"
            );
        } else {
            info!(source_id, requested = refs.len(), resolved = resolved.len(), "Resolved dependencies");
        }

        let sender = self.queue.sender();
        for resource in resolved {
            sender.try_enqueue(sender.item(resource, QueueOperation::Upsert));
        }
        Ok(())
    }
}

/// Keep only the most recently enqueued version of each resource id.
///
/// A redelivered item keeps its original enqueue time, so it can sit behind
/// a newer copy of the same id; the enqueue time decides, position breaks
/// ties. Survivors keep their original order.
pub fn latest_per_identity(items: Vec<QueueItem>) -> Vec<Resource> {
    let mut latest: HashMap<&str, (usize, DateTime<Utc>)> = HashMap::with_capacity(items.len());
    for (pos, item) in items.iter().enumerate() {
        let entry = latest
            .entry(item.resource.id.as_str())
            .or_insert((pos, item.enqueued_at));
        if item.enqueued_at >= entry.1 {
            *entry = (pos, item.enqueued_at);
        }
    }

    let winners: HashSet<usize> = latest.into_values().map(|(pos, _)| pos).collect();
    items
        .into_iter()
        .enumerate()
        .filter(|(pos, _)| winners.contains(pos))
        .map(|(_, item)| item.resource)
        .collect()
}
