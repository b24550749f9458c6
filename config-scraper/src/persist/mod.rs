//! Persistence boundary over the repositories.
//!
//! Regular resources are upserted one at a time so a bad item never sinks the
//! batch. Observation objects (events about another object) are not stored as
//! config items; they become changes on the object they describe. Every
//! change goes through the rate limiter and then the fingerprint cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::Result;
use crate::changes::{ChangeFingerprintCache, ChangeRateLimiter, RateDecision, TOO_MANY_CHANGES};
use crate::clock::SharedClock;
use crate::database::repositories::{ConfigItemRepository, UpsertOutcome};
use crate::domain::{ObservedChange, Resource, ScrapeSource};
use crate::metrics::{EngineMetrics, SourceCounter};
use crate::scrapers::{ItemOutcome, ResultSink, SaveBatch, SaveResult, SaveSummary};

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(3600);

pub struct StorePersister {
    items: Arc<dyn ConfigItemRepository>,
    fingerprints: Arc<ChangeFingerprintCache>,
    limiter: Arc<ChangeRateLimiter>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
    default_dedup_window: Duration,
}

impl StorePersister {
    pub fn new(
        items: Arc<dyn ConfigItemRepository>,
        fingerprints: Arc<ChangeFingerprintCache>,
        limiter: Arc<ChangeRateLimiter>,
        metrics: Arc<EngineMetrics>,
        clock: SharedClock,
    ) -> Self {
        Self {
            items,
            fingerprints,
            limiter,
            metrics,
            clock,
            default_dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }

    pub fn with_default_dedup_window(mut self, window: Duration) -> Self {
        self.default_dedup_window = window;
        self
    }

    pub fn fingerprints(&self) -> &Arc<ChangeFingerprintCache> {
        &self.fingerprints
    }

    /// Changes an observation contributes when it carries none explicitly.
    fn observation_change(resource: &Resource) -> ObservedChange {
        let change_type = resource
            .config
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or(&resource.kind)
            .to_string();
        let mut change = ObservedChange::new(change_type, resource.config.clone());
        change.summary = resource
            .config
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string);
        change
    }

    async fn record_changes(
        &self,
        source: &ScrapeSource,
        target_id: &str,
        changes: &[ObservedChange],
        window: Duration,
        summary: &mut SaveSummary,
        errors: &mut Vec<String>,
    ) {
        for change in changes {
            // Repeats of a live row do not count against the rate limit.
            let collapses = self
                .fingerprints
                .would_collapse(target_id, &change.change_type, window);

            let to_record = if collapses {
                Some(change.clone())
            } else {
                match self.limiter.check(target_id, self.clock.now()) {
                    RateDecision::Allowed => Some(change.clone()),
                    RateDecision::Limited { first } => {
                        summary.changes_rate_limited += 1;
                        first.then(|| {
                            let mut marker = ObservedChange::new(
                                TOO_MANY_CHANGES,
                                json!({ "suppressed": change.change_type }),
                            );
                            marker.summary = Some(format!(
                                "changes on {target_id} are being rate limited"
                            ));
                            marker
                        })
                    }
                }
            };

            let Some(change) = to_record else { continue };
            match self
                .fingerprints
                .record_change(target_id, &change.change_type, &change, window)
                .await
            {
                Ok(recorded) if recorded.is_new => summary.changes_new += 1,
                Ok(_) => summary.changes_deduped += 1,
                Err(e) => {
                    warn!(
                        source_id = %source.id,
                        config_id = target_id,
                        change_type = %change.change_type,
                        error = %e,
                        "Failed to record change"
                    );
                    errors.push(format!("change {} on {target_id}: {e}", change.change_type));
                }
            }
        }
    }
}

#[async_trait]
impl ResultSink for StorePersister {
    async fn save(&self, source: &ScrapeSource, batch: SaveBatch) -> Result<SaveResult> {
        let window = source.dedup_window(self.default_dedup_window)?;
        let mut result = SaveResult::default();
        let mut summary = SaveSummary::default();
        let now = self.clock.now();

        for resource in &batch.upserts {
            if let Some(target) = &resource.involved {
                let changes = if resource.changes.is_empty() {
                    vec![Self::observation_change(resource)]
                } else {
                    resource.changes.clone()
                };
                // Failures belong to the observation itself, not the batch.
                let mut change_errors = Vec::new();
                self.record_changes(source, &target.id, &changes, window, &mut summary, &mut change_errors)
                    .await;
                summary.observations += 1;
                let outcome = if change_errors.is_empty() {
                    Ok(UpsertOutcome::Unchanged)
                } else {
                    Err(change_errors.join("; "))
                };
                result.items.push(ItemOutcome {
                    id: resource.id.clone(),
                    result: outcome,
                });
                continue;
            }

            match self.items.upsert(&source.id, resource, now).await {
                Ok(outcome) => {
                    summary.record(&resource.kind, Some(outcome));
                    self.record_changes(
                        source,
                        &resource.id,
                        &resource.changes,
                        window,
                        &mut summary,
                        &mut result.errors,
                    )
                    .await;
                    result.items.push(ItemOutcome {
                        id: resource.id.clone(),
                        result: Ok(outcome),
                    });
                }
                Err(e) => {
                    debug!(source_id = %source.id, id = %resource.id, error = %e, "Upsert failed");
                    summary.record(&resource.kind, None);
                    result.items.push(ItemOutcome {
                        id: resource.id.clone(),
                        result: Err(e.to_string()),
                    });
                }
            }
        }

        if !batch.deletes.is_empty() {
            let ids: Vec<String> = batch.deletes.iter().map(|r| r.id.clone()).collect();
            match self.items.soft_delete(&ids, batch.delete_reason, now).await {
                Ok(deleted) => summary.deleted = deleted,
                Err(e) => {
                    warn!(source_id = %source.id, count = ids.len(), error = %e, "Failed to delete items");
                    result.errors.push(format!("delete {} items: {e}", ids.len()));
                }
            }
        }

        self.metrics
            .add(&source.id, SourceCounter::ChangesNew, summary.changes_new);
        self.metrics
            .add(&source.id, SourceCounter::ChangesDeduped, summary.changes_deduped);
        self.metrics.add(
            &source.id,
            SourceCounter::ChangesRateLimited,
            summary.changes_rate_limited,
        );

        result.summary = summary;
        Ok(result)
    }
}
