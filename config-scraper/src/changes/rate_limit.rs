//! Per-resource change rate limiting.
//!
//! A sliding window of accepted change timestamps is kept per resource. Once
//! a resource has `max_count` accepted changes inside `window`, further
//! changes are suppressed until old ones age out.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::warn;

/// Change type recorded once when a resource becomes rate limited.
pub const TOO_MANY_CHANGES: &str = "TooManyChanges";

pub const DEFAULT_MAX_CHANGES: usize = 100;
pub const DEFAULT_CHANGE_WINDOW: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Suppressed. `first` is set only on the transition into the limited state.
    Limited { first: bool },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Default)]
struct Window {
    accepted: VecDeque<DateTime<Utc>>,
    limited: bool,
}

#[derive(Debug)]
pub struct ChangeRateLimiter {
    max_count: usize,
    window: chrono::Duration,
    resources: DashMap<String, Window>,
}

impl Default for ChangeRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHANGES, DEFAULT_CHANGE_WINDOW)
    }
}

impl ChangeRateLimiter {
    pub fn new(max_count: usize, window: Duration) -> Self {
        Self {
            max_count,
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX),
            resources: DashMap::new(),
        }
    }

    /// Account for one new change on `resource_id` at `now`.
    pub fn check(&self, resource_id: &str, now: DateTime<Utc>) -> RateDecision {
        let mut state = self.resources.entry(resource_id.to_string()).or_default();

        while let Some(oldest) = state.accepted.front() {
            if now - *oldest >= self.window {
                state.accepted.pop_front();
            } else {
                break;
            }
        }

        if state.accepted.len() < self.max_count {
            state.accepted.push_back(now);
            state.limited = false;
            return RateDecision::Allowed;
        }

        let first = !state.limited;
        state.limited = true;
        if first {
            warn!(
                resource_id,
                max_changes = self.max_count,
                window_secs = self.window.num_seconds(),
                "Resource is changing too often, suppressing changes"
            );
        }
        RateDecision::Limited { first }
    }

    pub fn is_limited(&self, resource_id: &str) -> bool {
        self.resources
            .get(resource_id)
            .is_some_and(|state| state.limited)
    }

    /// Drop resources whose window has emptied.
    pub fn prune(&self, now: DateTime<Utc>) {
        let window = self.window;
        self.resources.retain(|_, state| {
            state
                .accepted
                .back()
                .is_some_and(|latest| now - *latest < window)
        });
    }

    pub fn tracked(&self) -> usize {
        self.resources.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_after_max_count() {
        let limiter = ChangeRateLimiter::new(3, Duration::from_secs(60));
        let now = Utc::now();

        for _ in 0..3 {
            assert_eq!(limiter.check("pod-1", now), RateDecision::Allowed);
        }
        assert_eq!(limiter.check("pod-1", now), RateDecision::Limited { first: true });
        assert_eq!(limiter.check("pod-1", now), RateDecision::Limited { first: false });
        assert!(limiter.is_limited("pod-1"));

        assert!(limiter.check("pod-2", now).is_allowed());
    }

    #[test]
    fn test_window_slides() {
        let limiter = ChangeRateLimiter::new(2, Duration::from_secs(60));
        let start = Utc::now();

        limiter.check("pod-1", start);
        limiter.check("pod-1", start + chrono::Duration::seconds(30));
        assert!(!limiter.check("pod-1", start + chrono::Duration::seconds(40)).is_allowed());

        // The first change has aged out.
        let later = start + chrono::Duration::seconds(61);
        assert!(limiter.check("pod-1", later).is_allowed());
        assert!(!limiter.is_limited("pod-1"));

        // Limiting again is a fresh transition.
        assert_eq!(limiter.check("pod-1", later), RateDecision::Limited { first: true });
    }

    #[test]
    fn test_prune_drops_idle_resources() {
        let limiter = ChangeRateLimiter::new(2, Duration::from_secs(60));
        let start = Utc::now();
        limiter.check("a", start);
        limiter.check("b", start + chrono::Duration::seconds(50));

        limiter.prune(start + chrono::Duration::seconds(90));
        assert_eq!(limiter.tracked(), 1);
    }
}
