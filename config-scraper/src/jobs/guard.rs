//! Singleton execution guard.
//!
//! A key→in-flight registry with test-and-set semantics. A caller that finds
//! its key already held does not wait: the run is skipped.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;

/// Registry of keys whose job is currently running.
#[derive(Debug, Clone, Default)]
pub struct SingletonGuard {
    inflight: Arc<DashMap<String, ()>>,
}

/// Proof of holding a key. Dropping it releases the key, including on panic.
#[derive(Debug)]
pub struct GuardPermit {
    inflight: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for GuardPermit {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

impl SingletonGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take `key` if nobody holds it.
    pub fn try_acquire(&self, key: &str) -> Option<GuardPermit> {
        match self.inflight.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(GuardPermit {
                    inflight: self.inflight.clone(),
                    key: key.to_string(),
                })
            }
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.inflight.contains_key(key)
    }

    /// Run `fut` under `key`, or return `None` without polling it.
    pub async fn try_run<F, T>(&self, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        let _permit = self.try_acquire(key)?;
        Some(fut.await)
    }

    /// Wrap `f` so that every call runs it under `key`.
    ///
    /// A call made while another is in flight resolves to `None` at once.
    pub fn guard<F, Fut, T>(
        &self,
        key: impl Into<String>,
        f: F,
    ) -> impl Fn() -> BoxFuture<'static, Option<T>> + Clone + Send + Sync + 'static
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.clone();
        let key: Arc<str> = Arc::from(key.into());
        let f = Arc::new(f);
        move || {
            let guard = guard.clone();
            let key = key.clone();
            let f = f.clone();
            async move {
                let _permit = guard.try_acquire(&key)?;
                Some(f().await)
            }
            .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_run_once() {
        let guard = SingletonGuard::new();
        let executions = Arc::new(AtomicUsize::new(0));

        let counter = executions.clone();
        let guarded = guard.guard("consume", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });

        let results = futures::future::join_all((0..5).map(|_| guarded())).await;

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert!(!guard.is_running("consume"));
    }

    #[tokio::test]
    async fn test_concurrent_tasks_run_once() {
        let guard = SingletonGuard::new();
        let executions = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);

        let counter = executions.clone();
        let guarded = guard.guard("scrape", move || {
            let counter = counter.clone();
            let mut release = release_rx.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = release.wait_for(|done| *done).await;
            }
        });

        let first = tokio::spawn(guarded());
        while !guard.is_running("scrape") {
            tokio::task::yield_now().await;
        }

        let others: Vec<_> = (0..4).map(|_| tokio::spawn(guarded())).collect();
        for handle in others {
            assert!(handle.await.unwrap().is_none());
        }

        release_tx.send(true).unwrap();
        assert!(first.await.unwrap().is_some());
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_released_after_error_and_panic() {
        let guard = SingletonGuard::new();

        let res: Option<Result<(), &str>> = guard.try_run("k", async { Err("boom") }).await;
        assert_eq!(res, Some(Err("boom")));
        assert!(!guard.is_running("k"));

        let g = guard.clone();
        let handle = tokio::spawn(async move {
            g.try_run("k", async { panic!("scraper panicked") }).await
        });
        assert!(handle.await.is_err());
        assert!(!guard.is_running("k"));

        assert_eq!(guard.try_run("k", async { 1 }).await, Some(1));
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let guard = SingletonGuard::new();
        let _a = guard.try_acquire("a").unwrap();
        assert!(guard.try_acquire("a").is_none());
        assert!(guard.try_acquire("b").is_some());
    }
}
