//! Stale resource reclaimer.
//!
//! Marks resources that were not re-observed within their source's timeout as
//! deleted with reason [`DeleteReason::Stale`], then revives any stale-marked
//! resource that has been observed again since. Both halves always run
//! together, mark first, so a resource seen right at the boundary never stays
//! flagged. Resources deleted for any other reason are never revived here.
//!
//! [`DeleteReason::Stale`]: crate::domain::DeleteReason::Stale

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::database::repositories::ConfigItemRepository;
use crate::domain::StaleTimeout;
use crate::metrics::{EngineMetrics, SourceCounter};
use crate::Result;

/// What one reclaim pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub marked: u64,
    pub revived: u64,
    /// Set when the source keeps stale items and nothing was touched.
    pub skipped: bool,
}

/// Timeout to use after a full scrape that started at `scrape_started`.
///
/// Items refreshed early in a long scrape must not be reaped by the sweep that
/// follows it, so the timeout is stretched to cover the whole scrape.
pub fn effective_timeout(
    configured: Duration,
    scrape_started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Duration {
    let elapsed = (now - scrape_started).to_std().unwrap_or(Duration::ZERO);
    configured.max(elapsed)
}

pub struct StaleReclaimer {
    items: Arc<dyn ConfigItemRepository>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
}

impl StaleReclaimer {
    pub fn new(
        items: Arc<dyn ConfigItemRepository>,
        metrics: Arc<EngineMetrics>,
        clock: SharedClock,
    ) -> Self {
        Self {
            items,
            metrics,
            clock,
        }
    }

    /// Run the mark/revive pair for one source.
    pub async fn reclaim(&self, source_id: &str, timeout: StaleTimeout) -> Result<ReclaimReport> {
        let timeout = match timeout {
            StaleTimeout::Keep => {
                debug!(source_id, "Source keeps stale items, skipping reclaim");
                return Ok(ReclaimReport {
                    skipped: true,
                    ..Default::default()
                });
            }
            StaleTimeout::After(timeout) => timeout,
        };

        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let marked = self.items.mark_stale(source_id, cutoff, now).await?;
        let revived = self.items.revive_stale(source_id).await?;

        self.metrics.add(source_id, SourceCounter::StaleMarked, marked);
        self.metrics.add(source_id, SourceCounter::StaleRevived, revived);

        if marked > 0 || revived > 0 {
            info!(source_id, marked, revived, ?timeout, "Reclaimed stale items");
        }

        Ok(ReclaimReport {
            marked,
            revived,
            skipped: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_timeout_covers_long_scrapes() {
        let now = Utc::now();
        let day = Duration::from_secs(86_400);

        let short = now - chrono::Duration::minutes(5);
        assert_eq!(effective_timeout(day, short, now), day);

        let long = now - chrono::Duration::hours(30);
        assert_eq!(
            effective_timeout(day, long, now),
            Duration::from_secs(30 * 3600)
        );

        // Clock skew never shrinks the timeout.
        let future = now + chrono::Duration::minutes(1);
        assert_eq!(effective_timeout(day, future, now), day);
    }
}
