//! Retention of change rows and deleted items.
//!
//! Three passes, each driven by its own scheduled job:
//! - per-source change rules (`retention.changes` on the source spec), by
//!   age or by count of the newest rows of one change type
//! - a global age limit on change rows
//! - hard deletion of items that have been soft-deleted for longer than the
//!   item retention period

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::Result;
use crate::clock::SharedClock;
use crate::database::repositories::{ChangeRepository, ConfigItemRepository, SourceRepository};

/// What one pass over the per-source change rules did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    /// Rules applied without error.
    pub rules: usize,
    /// Change rows deleted.
    pub deleted: u64,
    pub errors: Vec<String>,
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct RetentionCleaner {
    sources: Arc<dyn SourceRepository>,
    items: Arc<dyn ConfigItemRepository>,
    changes: Arc<dyn ChangeRepository>,
    clock: SharedClock,
}

impl RetentionCleaner {
    pub fn new(
        sources: Arc<dyn SourceRepository>,
        items: Arc<dyn ConfigItemRepository>,
        changes: Arc<dyn ChangeRepository>,
        clock: SharedClock,
    ) -> Self {
        Self {
            sources,
            items,
            changes,
            clock,
        }
    }

    /// Apply every source's change retention rules.
    ///
    /// A bad rule or a failed delete is reported and the pass moves on.
    pub async fn apply_change_rules(&self) -> Result<RetentionReport> {
        let mut report = RetentionReport::default();
        let now = self.clock.now();

        for source in self.sources.list().await? {
            let rules = match source.change_retention_rules() {
                Ok(rules) => rules,
                Err(e) => {
                    report.errors.push(e.to_string());
                    continue;
                }
            };
            for rule in rules {
                let older_than = rule.max_age.map(|age| cutoff(now, age));
                match self
                    .changes
                    .delete_by_retention(&source.id, &rule.change_type, older_than, rule.keep_latest)
                    .await
                {
                    Ok(deleted) => {
                        report.rules += 1;
                        report.deleted += deleted;
                        if deleted > 0 {
                            info!(
                                source_id = %source.id,
                                change_type = %rule.change_type,
                                deleted,
                                "Applied change retention"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(source_id = %source.id, change_type = %rule.change_type, error = %e, "Change retention failed");
                        report
                            .errors
                            .push(format!("{} {}: {e}", source.id, rule.change_type));
                    }
                }
            }
        }
        Ok(report)
    }

    /// Delete change rows not observed within `max_age`.
    pub async fn cleanup_changes(&self, max_age: Duration) -> Result<u64> {
        let deleted = self
            .changes
            .delete_older_than(cutoff(self.clock.now(), max_age))
            .await?;
        if deleted > 0 {
            info!(deleted, ?max_age, "Deleted old config changes");
        }
        Ok(deleted)
    }

    /// Remove items soft-deleted longer ago than `retention`.
    pub async fn cleanup_items(&self, retention: Duration) -> Result<u64> {
        let purged = self
            .items
            .purge_deleted(cutoff(self.clock.now(), retention))
            .await?;
        if purged > 0 {
            info!(purged, ?retention, "Purged deleted config items");
        }
        Ok(purged)
    }
}
