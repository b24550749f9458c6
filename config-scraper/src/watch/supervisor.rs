//! Keeps a watch loop alive across failures.
//!
//! `Running → Failed → Backoff → Running …` until the cancellation token
//! fires. Backoff doubles from a base interval; once the time spent backing
//! off would pass the ceiling, it starts over from the base.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Result;

pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(1);

pub const DEFAULT_BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Exponential backoff whose cumulative wait is bounded by a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    next: Duration,
    elapsed: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_BACKOFF, DEFAULT_BACKOFF_CEILING)
    }
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base,
            ceiling,
            next: base,
            elapsed: Duration::ZERO,
        }
    }

    /// Delay before the next retry.
    pub fn next_delay(&mut self) -> Duration {
        if self.elapsed + self.next > self.ceiling {
            debug!(elapsed = ?self.elapsed, "Backoff budget exhausted, starting over");
            self.reset();
        }
        let delay = self.next;
        self.elapsed += delay;
        self.next = (self.next * 2).min(self.ceiling.max(self.base));
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.base;
        self.elapsed = Duration::ZERO;
    }

    pub fn base(&self) -> Duration {
        self.base
    }
}

/// Supervisor lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Running,
    Backoff,
    Stopped,
}

/// Counters returned when a supervisor stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub runs: u64,
    pub failures: u64,
}

/// Runs a watch function until cancelled, restarting it on failure.
pub struct WatchSupervisor {
    name: String,
    backoff: Backoff,
    cancel: CancellationToken,
    state: WatchState,
}

impl WatchSupervisor {
    pub fn new(name: impl Into<String>, backoff: Backoff, cancel: CancellationToken) -> Self {
        Self {
            name: name.into(),
            backoff,
            cancel,
            state: WatchState::Stopped,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Drive `watch` until the token is cancelled.
    ///
    /// `watch` gets a child token; in-flight backoff sleeps are interrupted
    /// by cancellation. A watch that ran longer than the backoff ceiling
    /// before failing starts again from the base interval.
    pub async fn run<F, Fut>(mut self, mut watch: F) -> SupervisorStats
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut stats = SupervisorStats::default();
        info!(watch = %self.name, "Watch supervisor started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            self.state = WatchState::Running;
            stats.runs += 1;
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = watch(self.cancel.child_token()) => result,
            };

            if started.elapsed() >= self.backoff.ceiling {
                self.backoff.reset();
            }

            let delay = match result {
                Ok(()) => {
                    debug!(watch = %self.name, "Watch ended, restarting");
                    self.backoff.reset();
                    self.backoff.base()
                }
                Err(e) => {
                    stats.failures += 1;
                    let delay = self.backoff.next_delay();
                    warn!(
                        watch = %self.name,
                        error = %e,
                        retry_in = ?delay,
                        failures = stats.failures,
                        "Watch failed"
                    );
                    delay
                }
            };

            self.state = WatchState::Backoff;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state = WatchState::Stopped;
        info!(watch = %self.name, runs = stats.runs, failures = stats.failures, "Watch supervisor stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_backoff_grows_then_resets_to_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        // 1+2+4+8+16 = 31; another 32 would pass the ceiling.
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 1, 2]);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), DEFAULT_BASE_BACKOFF);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_after_failures_until_cancelled() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU64::new(0));

        let supervisor = WatchSupervisor::new("s1/Pod", Backoff::default(), cancel.clone());
        let c = calls.clone();
        let handle = tokio::spawn(supervisor.run(move |_token| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::source("s1", "watch stream closed"))
            }
        }));

        // Failures at t=0, 1, 3, 7 (delays 1, 2, 4).
        tokio::time::sleep(Duration::from_millis(7_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_running_watch() {
        let cancel = CancellationToken::new();
        let supervisor = WatchSupervisor::new("s1/Pod", Backoff::default(), cancel.clone());
        let handle = tokio::spawn(supervisor.run(|token: CancellationToken| async move {
            token.cancelled().await;
            Ok(())
        }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(600));
        let supervisor = WatchSupervisor::new("s1/Pod", backoff, cancel.clone());
        let started = Instant::now();
        let handle = tokio::spawn(supervisor.run(|_token| async {
            Err(Error::source("s1", "watch stream closed"))
        }));

        // The watch has failed and the supervisor is 1s into a 60s sleep.
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let stats = handle.await.unwrap();

        assert_eq!(stats.runs, 1);
        assert_eq!(stats.failures, 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
