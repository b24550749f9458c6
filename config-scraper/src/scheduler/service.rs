//! Scheduler service.
//!
//! The Scheduler owns every cron entry of the engine:
//! - one scrape job per source, keyed by the source id
//! - for event-driven sources, the watch loops plus a fast consumer job
//!   (`<id>-consume-watch`)
//! - a stale sweep per source (`<id>-reclaim-stale`)
//! - a global `ScrapeSourceSync` job that reconciles all of the above with
//!   the stored source definitions
//! - global retention jobs for change rows and deleted items
//!
//! Jobs capture the source definition they were built from. A definition
//! that differs from the captured one tears the job down and rebuilds it.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::concurrency::ScrapeLimits;
use super::registry::JobRegistry;
use super::schedule::Schedule;
use crate::changes::{ChangeFingerprintCache, ChangeRateLimiter};
use crate::clock::{SharedClock, system_clock};
use crate::config::{EngineConfig, SourceEvent, SourceEventBroadcaster};
use crate::database::DbPool;
use crate::database::repositories::{
    ChangeRepository, ConfigItemRepository, JobHistoryRepository, SourceRepository, SqlxChangeRepository,
    SqlxConfigItemRepository, SqlxJobHistoryRepository, SqlxSourceRepository,
};
use crate::domain::{DeleteReason, ScrapeSource, StaleTimeout};
use crate::jobs::{
    HistoryRecorder, HistoryRecorderConfig, Job, JobExecutor, JobHistory, JobRuntime, JobStatus,
    Retention, SingletonGuard,
};
use crate::metrics::{EngineMetrics, SourceCounter};
use crate::persist::StorePersister;
use crate::retention::RetentionCleaner;
use crate::scrapers::{
    ResourceWatcher, ResultSink, SaveBatch, SaveResult, ScraperRegistry, ScraperSet,
};
use crate::stale::{StaleReclaimer, effective_timeout};
use crate::watch::resolved::DEFAULT_RESOLVED_TTL;
use crate::watch::{Backoff, IncrementalConsumer, ResolvedItems, WatchQueue, WatchSupervisor};
use crate::{Error, Result};

/// Key and history name of the periodic source reconciliation job.
pub const SOURCE_SYNC_JOB: &str = "ScrapeSourceSync";

pub const CHANGE_RETENTION_JOB: &str = "ChangeRetentionRules";
pub const CLEANUP_CHANGES_JOB: &str = "CleanupConfigChanges";
pub const CLEANUP_ITEMS_JOB: &str = "CleanupConfigItems";

/// Jobs not owned by any source; reconciliation never removes them.
const GLOBAL_JOBS: &[&str] = &[
    SOURCE_SYNC_JOB,
    CHANGE_RETENTION_JOB,
    CLEANUP_CHANGES_JOB,
    CLEANUP_ITEMS_JOB,
];

const CHANGE_RETENTION_INTERVAL: Duration = Duration::from_secs(3600);
const CLEANUP_CHANGES_INTERVAL: Duration = Duration::from_secs(24 * 3600);
/// Nightly at 02:00.
const CLEANUP_ITEMS_SCHEDULE: &str = "0 2 * * *";

const SCRAPE_JOB_NAME: &str = "Scraper";
const CONSUME_JOB_NAME: &str = "ConsumeWatch";
const RECLAIM_JOB_NAME: &str = "ReclaimStale";

const CONSUME_SUFFIX: &str = "-consume-watch";
const RECLAIM_SUFFIX: &str = "-reclaim-stale";

const WATCH_BACKOFF_BASE: Duration = Duration::from_secs(1);
const WATCH_BACKOFF_CEILING: Duration = Duration::from_secs(60);

pub fn consume_job_key(source_id: &str) -> String {
    format!("{source_id}{CONSUME_SUFFIX}")
}

pub fn reclaim_job_key(source_id: &str) -> String {
    format!("{source_id}{RECLAIM_SUFFIX}")
}

/// Source id a job key belongs to.
fn owner_of(key: &str) -> &str {
    key.strip_suffix(CONSUME_SUFFIX)
        .or_else(|| key.strip_suffix(RECLAIM_SUFFIX))
        .unwrap_or(key)
}

/// Result of an on-demand run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunNowResponse {
    pub status: JobStatus,
    pub total: i64,
    pub success: i64,
    pub failed: i64,
    pub errors: Vec<String>,
}

impl From<&JobHistory> for RunNowResponse {
    fn from(history: &JobHistory) -> Self {
        let failed = history.errors.len() as i64;
        Self {
            status: history.status,
            total: history.success_count + failed,
            success: history.success_count,
            failed,
            errors: history.errors.clone(),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    /// Job keys removed because their source no longer exists.
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

/// Watch loops and queue of one event-driven source.
struct WatchSet {
    queue: Arc<WatchQueue>,
    cancel: CancellationToken,
}

struct Inner {
    config: EngineConfig,
    clock: SharedClock,
    metrics: Arc<EngineMetrics>,
    registry: JobRegistry,
    limits: ScrapeLimits,
    scrapers: ScraperRegistry,
    sources: Arc<dyn SourceRepository>,
    history: Arc<dyn JobHistoryRepository>,
    persister: Arc<StorePersister>,
    limiter: Arc<ChangeRateLimiter>,
    reclaimer: Arc<StaleReclaimer>,
    retention: Arc<RetentionCleaner>,
    resolved: Arc<ResolvedItems>,
    watches: DashMap<String, WatchSet>,
    events: SourceEventBroadcaster,
    cancel: CancellationToken,
}

/// Cheap to clone; clones share the same jobs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Build the scheduler and everything it drives over `pool`.
    pub fn new(config: EngineConfig, pool: DbPool, scrapers: ScraperRegistry) -> Self {
        Self::with_clock(config, pool, scrapers, system_clock())
    }

    pub fn with_clock(
        config: EngineConfig,
        pool: DbPool,
        scrapers: ScraperRegistry,
        clock: SharedClock,
    ) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let cancel = CancellationToken::new();

        let history: Arc<dyn JobHistoryRepository> =
            Arc::new(SqlxJobHistoryRepository::new(pool.clone()));
        let items: Arc<dyn ConfigItemRepository> =
            Arc::new(SqlxConfigItemRepository::new(pool.clone()));
        let changes: Arc<dyn ChangeRepository> = Arc::new(SqlxChangeRepository::new(pool.clone()));
        let sources: Arc<dyn SourceRepository> = Arc::new(SqlxSourceRepository::new(pool));

        let recorder = Arc::new(HistoryRecorder::new(
            history.clone(),
            HistoryRecorderConfig::default(),
        ));
        let executor = JobExecutor::new(
            SingletonGuard::new(),
            recorder,
            metrics.clone(),
            clock.clone(),
        );

        let retention = Arc::new(RetentionCleaner::new(
            sources.clone(),
            items.clone(),
            changes.clone(),
            clock.clone(),
        ));
        let fingerprints = Arc::new(ChangeFingerprintCache::new(changes, clock.clone()));
        let limiter = Arc::new(ChangeRateLimiter::new(
            config.changes_max_count,
            config.changes_max_window,
        ));
        let persister = Arc::new(
            StorePersister::new(
                items.clone(),
                fingerprints,
                limiter.clone(),
                metrics.clone(),
                clock.clone(),
            )
            .with_default_dedup_window(config.dedup_window),
        );

        let inner = Inner {
            limits: ScrapeLimits::new(config.global_concurrency, &config.type_concurrency),
            registry: JobRegistry::new(executor, clock.clone(), cancel.clone()),
            reclaimer: Arc::new(StaleReclaimer::new(items, metrics.clone(), clock.clone())),
            retention,
            resolved: Arc::new(ResolvedItems::new(DEFAULT_RESOLVED_TTL, clock.clone())),
            watches: DashMap::new(),
            events: SourceEventBroadcaster::new(),
            config,
            clock,
            metrics,
            scrapers,
            sources,
            history,
            persister,
            limiter,
            cancel,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Broadcaster the control plane publishes source updates on.
    pub fn events(&self) -> SourceEventBroadcaster {
        self.inner.events.clone()
    }

    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.inner.metrics.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Keys of every registered cron entry, sorted.
    pub fn job_keys(&self) -> Vec<String> {
        self.inner.registry.keys()
    }

    /// The job registered under `key`.
    pub fn job(&self, key: &str) -> Option<Job> {
        self.inner.registry.get(key)
    }

    /// Whether watch loops are running for the source.
    pub fn is_watching(&self, source_id: &str) -> bool {
        self.inner.watches.contains_key(source_id)
    }

    /// Recorded runs of a job, newest first. Pending records are flushed first.
    pub async fn history(&self, job_name: &str, resource_id: &str) -> Result<Vec<JobHistory>> {
        self.inner.registry.executor().recorder().flush().await;
        self.inner.history.list(job_name, resource_id).await
    }

    /// Register the periodic source sync job and the retention jobs.
    ///
    /// The sync job and the change rules run once right away.
    pub fn start(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let job = Job::new(
            SOURCE_SYNC_JOB,
            SOURCE_SYNC_JOB,
            Schedule::every(self.inner.config.sync_interval),
            move |rt: JobRuntime| {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Ok(());
                    };
                    let report = inner.sync_all().await?;
                    inner.expire_caches();
                    rt.add_successes(report.synced as i64);
                    for err in &report.errors {
                        rt.add_error(err);
                    }
                    rt.add_details("sync", &report);
                    Ok(())
                }
            },
        )
        .run_on_start(true)
        .with_retention(Retention::FEW);

        self.inner.registry.schedule(job);
        for job in self.inner.retention_jobs()? {
            self.inner.registry.schedule(job);
        }
        Ok(())
    }

    /// Reconcile the jobs of one source with its definition.
    ///
    /// Configuration errors leave the source unscheduled.
    pub async fn sync_source(&self, source: &ScrapeSource) -> Result<()> {
        self.inner.sync_source(source).await
    }

    /// Remove every job and watch of a source.
    pub fn delete_source(&self, source_id: &str) {
        self.inner.delete_source(source_id);
    }

    /// Reconcile every stored source and drop jobs of sources that are gone.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        self.inner.sync_all().await
    }

    /// Scrape a source now, outside its schedule.
    ///
    /// Shares the singleton guard with the scheduled run: if the source is
    /// already being scraped the response status is `SKIPPED`.
    pub async fn run_now(&self, source_id: &str) -> Result<RunNowResponse> {
        let source = Arc::new(self.inner.sources.get(source_id).await?);
        let job = self.inner.scrape_job(source, Schedule::never());
        let history = self
            .inner
            .registry
            .executor()
            .execute(&job, self.inner.cancel.child_token())
            .await;
        Ok(RunNowResponse::from(&history))
    }

    /// Start the sync job and react to source events until cancelled.
    pub async fn run(&self) -> Result<()> {
        info!("Starting scheduler");
        let mut events = self.inner.events.subscribe();
        self.start()?;

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    info!("Scheduler received cancellation signal");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => self.inner.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Scheduler lagged {} source events, resyncing", n);
                        if let Err(e) = self.inner.sync_all().await {
                            warn!(error = %e, "Resync after lag failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Source event channel closed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop every job and watch, then flush run history.
    pub async fn shutdown(&self) {
        info!("Shutting down scheduler");
        self.inner.cancel.cancel();
        self.inner.registry.stop_all().await;

        let ids: Vec<String> = self.inner.watches.iter().map(|w| w.key().clone()).collect();
        for id in ids {
            self.inner.stop_watches(&id);
        }

        self.inner.registry.executor().recorder().close().await;
        info!("Scheduler stopped");
    }
}

impl Inner {
    async fn handle_event(self: &Arc<Self>, event: SourceEvent) {
        debug!("Handling source event: {}", event.description());
        match event {
            SourceEvent::Upserted(source) => {
                if let Err(e) = self.sources.save(&source).await {
                    warn!(source_id = %source.id, error = %e, "Failed to store source");
                }
                if source.deleted {
                    self.delete_source(&source.id);
                } else if let Err(e) = self.sync_source(&source).await {
                    warn!(source_id = %source.id, error = %e, "Failed to schedule source");
                }
            }
            SourceEvent::Deleted { source_id } => {
                match self.sources.mark_deleted(&source_id).await {
                    Ok(()) | Err(Error::NotFound { .. }) => {}
                    Err(e) => warn!(source_id = %source_id, error = %e, "Failed to mark source deleted"),
                }
                self.delete_source(&source_id);
            }
        }
    }

    fn effective_schedule(&self, source: &ScrapeSource) -> Result<Schedule> {
        let requested = match source.spec.schedule.trim() {
            "" => self.config.default_schedule.as_str(),
            expr => expr,
        };
        let (schedule, clamped) =
            Schedule::parse(requested)?.at_least(self.config.min_schedule, self.clock.now());
        if clamped {
            warn!(
                source_id = %source.id,
                requested,
                applied = %schedule.expr(),
                "Schedule fires more often than allowed, clamping"
            );
        }
        Ok(schedule)
    }

    /// Everything a source needs before it can be scheduled.
    fn prepare(&self, source: &ScrapeSource) -> Result<(Schedule, StaleTimeout, ScraperSet)> {
        source.validate()?;
        let schedule = self.effective_schedule(source)?;
        let stale = source.stale_timeout(self.config.stale_default_timeout)?;
        let set = self.scrapers.get(&source.source_type).cloned().ok_or_else(|| {
            Error::config(format!(
                "no scraper registered for source type '{}'",
                source.source_type
            ))
        })?;
        Ok((schedule, stale, set))
    }

    async fn sync_source(self: &Arc<Self>, source: &ScrapeSource) -> Result<()> {
        if source.is_unscheduled() || source.is_disabled() {
            if self.remove_jobs(&source.id) {
                info!(source_id = %source.id, "Unscheduled source");
            }
            return Ok(());
        }

        let (schedule, stale, set) = match self.prepare(source) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.remove_jobs(&source.id);
                return Err(e);
            }
        };
        let source = Arc::new(source.clone());

        // Full scrape
        if set.scraper.is_some() {
            let stale_job = self
                .registry
                .get(&source.id)
                .is_none_or(|job| job.diverges_from(&source) || job.schedule != schedule);
            if stale_job {
                self.registry
                    .schedule(self.scrape_job(source.clone(), schedule));
            }
        } else {
            self.registry.unschedule(&source.id);
        }

        // Watches and their consumer
        let consume_key = consume_job_key(&source.id);
        match set.watcher.clone().filter(|_| source.is_event_driven()) {
            Some(watcher) => {
                let current = self.watches.contains_key(&source.id)
                    && self
                        .registry
                        .get(&consume_key)
                        .is_some_and(|job| !job.diverges_from(&source));
                if !current {
                    self.stop_watches(&source.id);
                    let consumer = self.start_watches(&source, &set, watcher);
                    self.registry
                        .schedule(self.consume_job(source.clone(), consumer));
                }
            }
            None => {
                self.stop_watches(&source.id);
                self.registry.unschedule(&consume_key);
            }
        }

        // Stale sweep
        let reclaim_key = reclaim_job_key(&source.id);
        match stale {
            StaleTimeout::Keep => {
                self.registry.unschedule(&reclaim_key);
            }
            StaleTimeout::After(_) => {
                let stale_job = self
                    .registry
                    .get(&reclaim_key)
                    .is_none_or(|job| job.diverges_from(&source));
                if stale_job {
                    self.registry
                        .schedule(self.reclaim_job(source.clone(), stale));
                }
            }
        }

        debug!(source_id = %source.id, version = source.version, "Source synced");
        Ok(())
    }

    /// Returns whether anything was running for the source.
    fn remove_jobs(&self, source_id: &str) -> bool {
        let mut removed = self.registry.unschedule(source_id);
        removed |= self.registry.unschedule(&consume_job_key(source_id));
        removed |= self.registry.unschedule(&reclaim_job_key(source_id));
        removed |= self.stop_watches(source_id);
        removed
    }

    fn delete_source(&self, source_id: &str) {
        if self.remove_jobs(source_id) {
            info!(source_id, "Removed jobs of deleted source");
        }
        self.metrics.remove_source(source_id);
    }

    /// Sweep expired entries from the in-memory caches.
    fn expire_caches(&self) {
        let fingerprints = self.persister.fingerprints().cleanup_expired();
        let resolved = self.resolved.expire();
        self.limiter.prune(self.clock.now());
        if fingerprints > 0 || resolved > 0 {
            debug!(fingerprints, resolved, "Expired cache entries");
        }
    }

    async fn sync_all(self: &Arc<Self>) -> Result<SyncReport> {
        let sources = self.sources.list().await?;
        let mut report = SyncReport::default();

        for source in &sources {
            match self.sync_source(source).await {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    warn!(source_id = %source.id, error = %e, "Failed to sync source");
                    report.errors.push(format!("{}: {e}", source.id));
                }
            }
        }

        let live: HashSet<&str> = sources.iter().map(|s| s.id.as_str()).collect();
        for key in self.registry.keys() {
            if GLOBAL_JOBS.contains(&key.as_str()) || live.contains(owner_of(&key)) {
                continue;
            }
            if self.registry.unschedule(&key) {
                info!(job = %key, "Removed dangling job");
                report.removed.push(key);
            }
        }
        let orphans: Vec<String> = self
            .watches
            .iter()
            .filter(|w| !live.contains(w.key().as_str()))
            .map(|w| w.key().clone())
            .collect();
        for id in orphans {
            self.stop_watches(&id);
        }

        Ok(report)
    }

    fn retention_jobs(&self) -> Result<Vec<Job>> {
        let rules = {
            let retention = self.retention.clone();
            Job::new(
                CHANGE_RETENTION_JOB,
                CHANGE_RETENTION_JOB,
                Schedule::every(CHANGE_RETENTION_INTERVAL),
                move |rt: JobRuntime| {
                    let retention = retention.clone();
                    async move {
                        let report = retention.apply_change_rules().await?;
                        rt.add_successes(report.rules as i64);
                        for err in &report.errors {
                            rt.add_error(err);
                        }
                        rt.add_details("retention", &report);
                        Ok(())
                    }
                },
            )
            .run_on_start(true)
            .with_retention(Retention::BALANCED)
        };

        let changes = {
            let retention = self.retention.clone();
            let max_age = self.config.change_retention;
            Job::new(
                CLEANUP_CHANGES_JOB,
                CLEANUP_CHANGES_JOB,
                Schedule::every(CLEANUP_CHANGES_INTERVAL),
                move |rt: JobRuntime| {
                    let retention = retention.clone();
                    async move {
                        let deleted = retention.cleanup_changes(max_age).await?;
                        rt.add_successes(deleted as i64);
                        Ok(())
                    }
                },
            )
            .with_retention(Retention::BALANCED)
        };

        let items = {
            let retention = self.retention.clone();
            let period = self.config.item_retention;
            Job::new(
                CLEANUP_ITEMS_JOB,
                CLEANUP_ITEMS_JOB,
                Schedule::parse(CLEANUP_ITEMS_SCHEDULE)?,
                move |rt: JobRuntime| {
                    let retention = retention.clone();
                    async move {
                        let purged = retention.cleanup_items(period).await?;
                        rt.add_successes(purged as i64);
                        Ok(())
                    }
                },
            )
            .with_retention(Retention::BALANCED)
        };

        Ok(vec![rules, changes, items])
    }

    fn scrape_job(self: &Arc<Self>, source: Arc<ScrapeSource>, schedule: Schedule) -> Job {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let captured = source.clone();
        Job::new(source.id.clone(), SCRAPE_JOB_NAME, schedule, move |rt: JobRuntime| {
            let weak = weak.clone();
            let source = captured.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                inner.run_scrape(&source, &rt).await
            }
        })
        .for_resource(source.id.clone())
        .with_retention(Retention::BALANCED)
        .run_on_start(source.run_on_schedule())
        .capturing(source)
    }

    async fn run_scrape(&self, source: &ScrapeSource, rt: &JobRuntime) -> Result<()> {
        let scraper = self
            .scrapers
            .get(&source.source_type)
            .and_then(|set| set.scraper.clone())
            .ok_or_else(|| {
                Error::config(format!(
                    "no scraper registered for source type '{}'",
                    source.source_type
                ))
            })?;

        let cancel = rt.cancel_token().clone();
        let Some(_permit) = self.limits.acquire(&source.source_type, &cancel).await else {
            debug!(source_id = %source.id, "Cancelled while waiting for a scrape slot");
            return Ok(());
        };

        let started = self.clock.now();
        info!(source_id = %source.id, source_type = %source.source_type, "Scraping source");

        let output = scraper.scrape(source, &cancel).await?;
        let scrape_errors = output.errors.len();
        for err in &output.errors {
            rt.add_error(err);
        }

        let batch = SaveBatch::new(output.resources, output.deleted, DeleteReason::FromAttribute);
        let result = self.persister.save(source, batch).await?;
        self.apply_save_result(source, rt, &result);
        rt.add_details("scrape_summary", &result.summary);

        // A partial scrape would reap everything it failed to see.
        if scrape_errors > 0 || result.failed() > 0 {
            debug!(source_id = %source.id, "Scrape had errors, not reclaiming stale items");
        } else if let StaleTimeout::After(timeout) =
            source.stale_timeout(self.config.stale_default_timeout)?
        {
            let timeout = effective_timeout(timeout, started, self.clock.now());
            let report = self
                .reclaimer
                .reclaim(&source.id, StaleTimeout::After(timeout))
                .await?;
            rt.add_details("stale", report);
        }

        info!(
            source_id = %source.id,
            saved = result.succeeded(),
            failed = result.failed() + scrape_errors,
            deleted = result.summary.deleted,
            "Scrape finished"
        );
        Ok(())
    }

    fn apply_save_result(&self, source: &ScrapeSource, rt: &JobRuntime, result: &SaveResult) {
        for item in &result.items {
            match &item.result {
                Ok(_) => {
                    rt.add_success();
                    self.resolved.set(item.id.clone());
                }
                Err(e) => rt.add_error(format!("{}: {e}", item.id)),
            }
        }
        for err in &result.errors {
            rt.add_error(err);
        }
        self.metrics
            .add(&source.id, SourceCounter::ItemsSaved, result.succeeded() as u64);
        self.metrics
            .add(&source.id, SourceCounter::ItemsFailed, result.failed() as u64);
        self.metrics
            .add(&source.id, SourceCounter::ItemsDeleted, result.summary.deleted);
    }

    fn start_watches(
        &self,
        source: &Arc<ScrapeSource>,
        set: &ScraperSet,
        watcher: Arc<dyn ResourceWatcher>,
    ) -> Arc<IncrementalConsumer> {
        let queue = Arc::new(WatchQueue::new(
            &source.id,
            self.config.queue_capacity,
            self.metrics.clone(),
            self.clock.clone(),
        ));
        let cancel = self.cancel.child_token();

        for kind in source.watch_kinds() {
            let supervisor = WatchSupervisor::new(
                format!("{}/{}", source.id, kind),
                Backoff::new(WATCH_BACKOFF_BASE, WATCH_BACKOFF_CEILING),
                cancel.child_token(),
            );
            let watcher = watcher.clone();
            let source = source.clone();
            let sender = queue.sender();
            tokio::spawn(async move {
                supervisor
                    .run(|token| {
                        let watcher = watcher.clone();
                        let source = source.clone();
                        let kind = kind.clone();
                        let sender = sender.clone();
                        async move { watcher.watch(&source, &kind, sender, token).await }
                    })
                    .await;
            });
        }

        let sink: Arc<dyn ResultSink> = self.persister.clone();
        let consumer = Arc::new(IncrementalConsumer::new(
            source.clone(),
            queue.clone(),
            set.resolver.clone(),
            sink,
            self.resolved.clone(),
            self.metrics.clone(),
            self.clock.clone(),
            self.config.consumer_config(),
        ));

        info!(source_id = %source.id, kinds = source.watch_kinds().len(), "Started watches");
        self.watches
            .insert(source.id.clone(), WatchSet { queue, cancel });
        consumer
    }

    /// Returns whether watches were running.
    fn stop_watches(&self, source_id: &str) -> bool {
        match self.watches.remove(source_id) {
            Some((_, set)) => {
                set.cancel.cancel();
                set.queue.close();
                debug!(source_id, "Stopped watches");
                true
            }
            None => false,
        }
    }

    fn consume_job(&self, source: Arc<ScrapeSource>, consumer: Arc<IncrementalConsumer>) -> Job {
        Job::new(
            consume_job_key(&source.id),
            CONSUME_JOB_NAME,
            Schedule::every(self.config.consume_interval),
            move |rt: JobRuntime| {
                let consumer = consumer.clone();
                async move {
                    let report = consumer.consume(rt.cancel_token()).await?;
                    rt.add_successes(report.saved as i64);
                    for err in &report.errors {
                        rt.add_error(err);
                    }
                    if report.drained > 0 {
                        rt.add_details("consume", &report);
                    }
                    Ok(())
                }
            },
        )
        .for_resource(source.id.clone())
        .with_retention(Retention::FEW)
        .capturing(source)
    }

    fn reclaim_job(&self, source: Arc<ScrapeSource>, timeout: StaleTimeout) -> Job {
        let reclaimer = self.reclaimer.clone();
        let source_id = source.id.clone();
        Job::new(
            reclaim_job_key(&source.id),
            RECLAIM_JOB_NAME,
            Schedule::every(self.config.stale_sweep_interval),
            move |rt: JobRuntime| {
                let reclaimer = reclaimer.clone();
                let source_id = source_id.clone();
                async move {
                    let report = reclaimer.reclaim(&source_id, timeout).await?;
                    rt.add_successes((report.marked + report.revived) as i64);
                    rt.add_details("stale", report);
                    Ok(())
                }
            },
        )
        .for_resource(source.id.clone())
        .with_retention(Retention::BALANCED)
        .capturing(source)
    }
}
