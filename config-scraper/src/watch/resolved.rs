//! Identity cache of resources known to be persisted.
//!
//! The consumer consults it to decide whether an observation's referenced
//! object exists yet. Entries expire after a TTL so deleted objects are
//! eventually forgotten.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::SharedClock;

pub const DEFAULT_RESOLVED_TTL: Duration = Duration::from_secs(24 * 3600);

/// Concurrent set of resource ids with per-entry expiry.
pub struct ResolvedItems {
    entries: DashMap<String, DateTime<Utc>>,
    ttl: chrono::Duration,
    clock: SharedClock,
}

impl ResolvedItems {
    pub fn new(ttl: Duration, clock: SharedClock) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    /// Whether `id` is known and not expired. Expired entries are dropped here.
    pub fn get(&self, id: &str) -> bool {
        let now = self.clock.now();
        let live = match self.entries.get(id) {
            Some(seen) => now.signed_duration_since(*seen) < self.ttl,
            None => return false,
        };
        if !live {
            self.entries.remove(id);
        }
        live
    }

    pub fn set(&self, id: impl Into<String>) {
        self.entries.insert(id.into(), self.clock.now());
    }

    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn expire(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, seen| now.signed_duration_since(*seen) < self.ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
