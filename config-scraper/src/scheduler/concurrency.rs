//! Limits on concurrent full scrapes.
//!
//! A scrape takes a permit for its source type (when that type has a limit)
//! and then a global permit. Taking the narrower permit first keeps a burst of
//! one slow type from parking global permits it cannot use.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Held for the duration of one scrape.
#[derive(Debug)]
pub struct ScrapePermit {
    _type_permit: Option<OwnedSemaphorePermit>,
    _global_permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct ScrapeLimits {
    global: Arc<Semaphore>,
    per_type: Arc<HashMap<String, Arc<Semaphore>>>,
}

impl ScrapeLimits {
    pub fn new(global: usize, per_type: &BTreeMap<String, usize>) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global.max(1))),
            per_type: Arc::new(
                per_type
                    .iter()
                    .map(|(t, n)| (t.clone(), Arc::new(Semaphore::new((*n).max(1)))))
                    .collect(),
            ),
        }
    }

    /// Wait for permits. Returns `None` if `cancel` fires first.
    pub async fn acquire(&self, source_type: &str, cancel: &CancellationToken) -> Option<ScrapePermit> {
        let type_permit = match self.per_type.get(source_type) {
            Some(semaphore) => {
                trace!(source_type, "Waiting for source type permit");
                Some(Self::acquire_one(semaphore.clone(), cancel).await?)
            }
            None => None,
        };
        let global_permit = Self::acquire_one(self.global.clone(), cancel).await?;

        Some(ScrapePermit {
            _type_permit: type_permit,
            _global_permit: global_permit,
        })
    }

    async fn acquire_one(
        semaphore: Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = semaphore.acquire_owned() => permit.ok(),
        }
    }

    pub fn available_global(&self) -> usize {
        self.global.available_permits()
    }

    /// Free permits for `source_type`, or `None` if the type is unlimited.
    pub fn available_for(&self, source_type: &str) -> Option<usize> {
        self.per_type.get(source_type).map(|s| s.available_permits())
    }
}
