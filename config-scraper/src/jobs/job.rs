//! Scheduled job definitions and their execution.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::guard::SingletonGuard;
use super::history::{HistoryRecorder, JobHistory, JobStatus, Retention};
use crate::Result;
use crate::clock::SharedClock;
use crate::domain::ScrapeSource;
use crate::metrics::{EngineMetrics, SourceCounter};
use crate::scheduler::schedule::Schedule;

/// Body of a job.
pub type JobFn = Arc<dyn Fn(JobRuntime) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Handle given to a running job body.
///
/// Cloning shares the same run history.
#[derive(Clone)]
pub struct JobRuntime {
    history: Arc<Mutex<JobHistory>>,
    cancel: CancellationToken,
    clock: SharedClock,
}

impl JobRuntime {
    pub fn new(history: JobHistory, cancel: CancellationToken, clock: SharedClock) -> Self {
        Self {
            history: Arc::new(Mutex::new(history)),
            cancel,
            clock,
        }
    }

    pub fn add_error(&self, err: impl fmt::Display) {
        self.history.lock().add_error(err);
    }

    pub fn add_success(&self) {
        self.history.lock().add_success();
    }

    pub fn add_successes(&self, n: i64) {
        self.history.lock().add_successes(n);
    }

    pub fn add_details(&self, key: impl Into<String>, value: impl Serialize) {
        self.history.lock().add_details(key, value);
    }

    pub fn error_count(&self) -> usize {
        self.history.lock().errors.len()
    }

    pub fn success_count(&self) -> i64 {
        self.history.lock().success_count
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    fn snapshot(&self) -> JobHistory {
        self.history.lock().clone()
    }
}

/// A unit of scheduled work bound to a cron entry.
#[derive(Clone)]
pub struct Job {
    /// Unique registry and guard key.
    pub key: String,
    /// Name recorded in run history.
    pub name: String,
    /// Scrape source this job belongs to; empty for global jobs.
    pub resource_id: String,
    pub schedule: Schedule,
    pub singleton: bool,
    pub run_on_start: bool,
    pub retention: Retention,
    /// Source definition the body was built from.
    pub captured: Option<Arc<ScrapeSource>>,
    run: JobFn,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("key", &self.key)
            .field("name", &self.name)
            .field("schedule", &self.schedule.expr())
            .field("singleton", &self.singleton)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new<F, Fut>(key: impl Into<String>, name: impl Into<String>, schedule: Schedule, f: F) -> Self
    where
        F: Fn(JobRuntime) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            key: key.into(),
            name: name.into(),
            resource_id: String::new(),
            schedule,
            singleton: true,
            run_on_start: false,
            retention: Retention::BALANCED,
            captured: None,
            run: Arc::new(move |rt| f(rt).boxed()),
        }
    }

    pub fn for_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = resource_id.into();
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn run_on_start(mut self, yes: bool) -> Self {
        self.run_on_start = yes;
        self
    }

    pub fn singleton(mut self, yes: bool) -> Self {
        self.singleton = yes;
        self
    }

    pub fn capturing(mut self, source: Arc<ScrapeSource>) -> Self {
        self.captured = Some(source);
        self
    }

    /// Whether `source` differs from the definition this job was built from.
    pub fn diverges_from(&self, source: &ScrapeSource) -> bool {
        match &self.captured {
            None => true,
            Some(captured) => {
                captured.spec != source.spec
                    || captured.source_type != source.source_type
                    || captured.name != source.name
            }
        }
    }
}

/// Runs jobs under the singleton guard and records their history.
#[derive(Clone)]
pub struct JobExecutor {
    guard: SingletonGuard,
    recorder: Arc<HistoryRecorder>,
    metrics: Arc<EngineMetrics>,
    clock: SharedClock,
}

impl JobExecutor {
    pub fn new(
        guard: SingletonGuard,
        recorder: Arc<HistoryRecorder>,
        metrics: Arc<EngineMetrics>,
        clock: SharedClock,
    ) -> Self {
        Self {
            guard,
            recorder,
            metrics,
            clock,
        }
    }

    pub fn guard(&self) -> &SingletonGuard {
        &self.guard
    }

    pub fn recorder(&self) -> &Arc<HistoryRecorder> {
        &self.recorder
    }

    /// Run `job` once. An overlapping singleton run is skipped, not queued.
    pub async fn execute(&self, job: &Job, cancel: CancellationToken) -> JobHistory {
        let _permit = if job.singleton {
            match self.guard.try_acquire(&job.key) {
                Some(permit) => Some(permit),
                None => {
                    debug!(job = %job.key, "Job already running, skipping");
                    self.metrics
                        .incr(&job.resource_id, SourceCounter::JobsSkipped);
                    let history = JobHistory::skipped(&job.name, &job.resource_id, self.clock.now());
                    self.recorder.record(history.clone(), job.retention);
                    return history;
                }
            }
        } else {
            None
        };

        let runtime = JobRuntime::new(
            JobHistory::start(&job.name, &job.resource_id, self.clock.now()),
            cancel,
            self.clock.clone(),
        );

        match AssertUnwindSafe((job.run)(runtime.clone())).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(job = %job.key, error = %e, "Job failed");
                runtime.add_error(e);
            }
            Err(_) => {
                warn!(job = %job.key, "Job panicked");
                runtime.add_error("job panicked");
            }
        }

        let mut history = runtime.snapshot();
        history.finish(self.clock.now());

        self.metrics.incr(&job.resource_id, SourceCounter::JobsRun);
        if history.status == JobStatus::Failed {
            self.metrics.incr(&job.resource_id, SourceCounter::JobsFailed);
        }
        debug!(
            job = %job.key,
            status = %history.status,
            success = history.success_count,
            errors = history.errors.len(),
            "Job finished"
        );

        self.recorder.record(history.clone(), job.retention);
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::database::memory_pool;
    use crate::database::repositories::SqlxJobHistoryRepository;
    use crate::jobs::history::HistoryRecorderConfig;
    use crate::Error;

    async fn executor() -> JobExecutor {
        let pool = memory_pool().await.unwrap();
        let recorder = HistoryRecorder::new(
            Arc::new(SqlxJobHistoryRepository::new(pool)),
            HistoryRecorderConfig::default(),
        );
        JobExecutor::new(
            SingletonGuard::new(),
            Arc::new(recorder),
            Arc::new(EngineMetrics::new()),
            system_clock(),
        )
    }

    fn every_minute() -> Schedule {
        Schedule::parse("@every 1m").unwrap()
    }

    #[tokio::test]
    async fn test_error_is_recorded_not_raised() {
        let exec = executor().await;
        let job = Job::new("s1", "scrape", every_minute(), |rt: JobRuntime| async move {
            rt.add_successes(2);
            Err(Error::source("s1", "connection refused"))
        });

        let history = exec.execute(&job, CancellationToken::new()).await;
        assert_eq!(history.status, JobStatus::Warning);
        assert_eq!(history.success_count, 2);
        assert_eq!(history.errors.len(), 1);
        assert!(!exec.guard().is_running("s1"));
    }

    #[tokio::test]
    async fn test_panicking_job_fails_and_releases() {
        let exec = executor().await;
        fn explode() -> Result<()> {
            panic!("unexpected payload")
        }
        let job = Job::new("s1", "scrape", every_minute(), |_rt: JobRuntime| async move {
            explode()
        });

        let history = exec.execute(&job, CancellationToken::new()).await;
        assert_eq!(history.status, JobStatus::Failed);
        assert!(!exec.guard().is_running("s1"));
    }

    #[tokio::test]
    async fn test_overlap_is_skipped() {
        let exec = executor().await;
        let job = Job::new("s1", "scrape", every_minute(), |rt: JobRuntime| async move {
            rt.add_success();
            Ok(())
        });

        let _held = exec.guard().try_acquire("s1").unwrap();
        let history = exec.execute(&job, CancellationToken::new()).await;
        assert_eq!(history.status, JobStatus::Skipped);
    }

    #[test]
    fn test_diverges_from_captured_spec() {
        let source = Arc::new(ScrapeSource::new("s1", "prod", "aws").with_schedule("@every 5m"));
        let job = Job::new("s1", "scrape", every_minute(), |_rt: JobRuntime| async { Ok(()) })
            .capturing(source.clone());

        assert!(!job.diverges_from(&source));
        let changed = (*source).clone().with_property("region", "eu-west-1");
        assert!(job.diverges_from(&changed));
    }
}
