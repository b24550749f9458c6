//! Scheduler integration tests.
//!
//! Collaborators are in-test doubles; storage is in-memory SQLite.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use config_scraper::config::{EngineConfig, SourceEvent};
use config_scraper::database::repositories::{
    ConfigItemRepository, SourceRepository, SqlxConfigItemRepository, SqlxSourceRepository,
};
use config_scraper::database::{DbPool, memory_pool};
use config_scraper::domain::{Resource, ScrapeSource, WatchKind};
use config_scraper::jobs::JobStatus;
use config_scraper::scheduler::{
    CHANGE_RETENTION_JOB, CLEANUP_CHANGES_JOB, CLEANUP_ITEMS_JOB, SOURCE_SYNC_JOB, Schedule,
    Scheduler, consume_job_key, reclaim_job_key,
};
use config_scraper::scrapers::{ResourceWatcher, ScrapeOutput, Scraper, ScraperRegistry};
use config_scraper::watch::QueueSender;
use config_scraper::{Error, Result};

/// Returns two pods and counts its invocations.
#[derive(Default)]
struct StaticScraper {
    calls: AtomicUsize,
}

#[async_trait]
impl Scraper for StaticScraper {
    async fn scrape(&self, _source: &ScrapeSource, _cancel: &CancellationToken) -> Result<ScrapeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ScrapeOutput {
            resources: vec![
                Resource::new("pod-1", "Pod", json!({"image": "nginx"})),
                Resource::new("pod-2", "Pod", json!({"image": "redis"})),
            ],
            ..Default::default()
        })
    }
}

/// Blocks until released.
#[derive(Default)]
struct BlockingScraper {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl Scraper for BlockingScraper {
    async fn scrape(&self, _source: &ScrapeSource, _cancel: &CancellationToken) -> Result<ScrapeOutput> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(ScrapeOutput::default())
    }
}

/// Fails one resource and returns the rest.
struct PartialScraper;

#[async_trait]
impl Scraper for PartialScraper {
    async fn scrape(&self, _source: &ScrapeSource, _cancel: &CancellationToken) -> Result<ScrapeOutput> {
        Ok(ScrapeOutput {
            resources: vec![Resource::new("vm-1", "VM", json!({"size": "m5.large"}))],
            errors: vec!["vm-2: access denied".to_string()],
            ..Default::default()
        })
    }
}

/// Holds the watch open until cancelled.
struct IdleWatcher;

#[async_trait]
impl ResourceWatcher for IdleWatcher {
    async fn watch(
        &self,
        _source: &ScrapeSource,
        _kind: &WatchKind,
        _queue: QueueSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

async fn setup() -> (DbPool, Arc<StaticScraper>, Scheduler) {
    let pool = memory_pool().await.expect("Failed to create test pool");
    let scraper = Arc::new(StaticScraper::default());
    let scrapers = ScraperRegistry::new()
        .with_scraper("kubernetes", scraper.clone())
        .with_watcher("kubernetes", Arc::new(IdleWatcher))
        .with_scraper("aws", Arc::new(PartialScraper));
    let scheduler = Scheduler::new(EngineConfig::default(), pool.clone(), scrapers);
    (pool, scraper, scheduler)
}

fn cluster(id: &str) -> ScrapeSource {
    ScrapeSource::new(id, "prod-cluster", "kubernetes").with_schedule("@every 1h")
}

mod sync_tests {
    use super::*;

    #[tokio::test]
    async fn test_sync_source_registers_scrape_and_reclaim_jobs() {
        let (_pool, _scraper, scheduler) = setup().await;

        scheduler.sync_source(&cluster("s1")).await.unwrap();

        assert_eq!(
            scheduler.job_keys(),
            vec!["s1".to_string(), reclaim_job_key("s1")]
        );
        assert!(!scheduler.is_watching("s1"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_driven_source_gets_watches_and_consumer() {
        let (_pool, _scraper, scheduler) = setup().await;
        let source = cluster("s1").with_watch(vec![WatchKind::new("v1", "Pod")]);

        scheduler.sync_source(&source).await.unwrap();
        assert!(scheduler.is_watching("s1"));
        assert!(scheduler.job_keys().contains(&consume_job_key("s1")));

        // Turning watches off drops the consumer but keeps the scrape job.
        let source = source.with_property("watch.disable", "true");
        scheduler.sync_source(&source).await.unwrap();
        assert!(!scheduler.is_watching("s1"));
        assert!(!scheduler.job_keys().contains(&consume_job_key("s1")));
        assert!(scheduler.job_keys().contains(&"s1".to_string()));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_never_schedule_removes_every_job() {
        let (_pool, _scraper, scheduler) = setup().await;
        let source = cluster("s1").with_watch(vec![WatchKind::new("v1", "Pod")]);
        scheduler.sync_source(&source).await.unwrap();
        assert_eq!(scheduler.job_keys().len(), 3);

        scheduler
            .sync_source(&source.with_schedule("@never"))
            .await
            .unwrap();
        assert!(scheduler.job_keys().is_empty());
        assert!(!scheduler.is_watching("s1"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_keep_stale_items_skips_reclaim_job() {
        let (_pool, _scraper, scheduler) = setup().await;
        scheduler
            .sync_source(&cluster("s1").with_stale_timeout("keep"))
            .await
            .unwrap();
        assert_eq!(scheduler.job_keys(), vec!["s1".to_string()]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_type_is_a_configuration_error() {
        let (_pool, _scraper, scheduler) = setup().await;
        let err = scheduler
            .sync_source(&ScrapeSource::new("s9", "ledger", "mainframe"))
            .await
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(scheduler.job_keys().is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_fast_schedule_is_clamped_and_empty_uses_default() {
        let (_pool, _scraper, scheduler) = setup().await;
        scheduler
            .sync_source(&cluster("fast").with_schedule("@every 5s"))
            .await
            .unwrap();
        scheduler
            .sync_source(&cluster("default").with_schedule(""))
            .await
            .unwrap();

        let fast = scheduler.job("fast").unwrap();
        assert_eq!(fast.schedule, Schedule::every(Duration::from_secs(29)));
        let default = scheduler.job("default").unwrap();
        assert_eq!(default.schedule, Schedule::parse("@every 60m").unwrap());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_changed_definition_rebuilds_job() {
        let (_pool, _scraper, scheduler) = setup().await;
        scheduler.sync_source(&cluster("s1")).await.unwrap();

        let changed = cluster("s1").with_property("namespace", "payments");
        assert!(scheduler.job("s1").unwrap().diverges_from(&changed));

        scheduler.sync_source(&changed).await.unwrap();
        assert!(!scheduler.job("s1").unwrap().diverges_from(&changed));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_sync_all_removes_dangling_jobs() {
        let (pool, _scraper, scheduler) = setup().await;
        let sources = SqlxSourceRepository::new(pool);
        sources.save(&cluster("s1")).await.unwrap();

        // Scheduled directly, never stored.
        scheduler.sync_source(&cluster("gone")).await.unwrap();

        let report = scheduler.sync_all().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(report.removed.contains(&"gone".to_string()));
        assert!(report.removed.contains(&reclaim_job_key("gone")));
        assert_eq!(
            scheduler.job_keys(),
            vec!["s1".to_string(), reclaim_job_key("s1")]
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_global_jobs_survive_sync() {
        let (_pool, _scraper, scheduler) = setup().await;
        scheduler.start().unwrap();

        let report = scheduler.sync_all().await.unwrap();
        assert!(report.removed.is_empty());
        let keys = scheduler.job_keys();
        for key in [SOURCE_SYNC_JOB, CHANGE_RETENTION_JOB, CLEANUP_CHANGES_JOB, CLEANUP_ITEMS_JOB] {
            assert!(keys.contains(&key.to_string()), "missing {key}");
        }
        assert_eq!(
            scheduler.job(CLEANUP_ITEMS_JOB).unwrap().schedule,
            Schedule::parse("0 2 * * *").unwrap()
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_source_drops_jobs() {
        let (_pool, _scraper, scheduler) = setup().await;
        scheduler.sync_source(&cluster("s1")).await.unwrap();
        scheduler.delete_source("s1");
        assert!(scheduler.job_keys().is_empty());
        scheduler.shutdown().await;
    }
}

mod run_now_tests {
    use super::*;

    #[tokio::test]
    async fn test_run_now_scrapes_and_saves() {
        let (pool, scraper, scheduler) = setup().await;
        SqlxSourceRepository::new(pool.clone())
            .save(&cluster("s1"))
            .await
            .unwrap();

        let response = scheduler.run_now("s1").await.unwrap();
        assert_eq!(response.status, JobStatus::Success);
        assert_eq!(response.success, 2);
        assert_eq!(response.total, 2);
        assert_eq!(scraper.calls.load(Ordering::SeqCst), 1);

        let items = SqlxConfigItemRepository::new(pool);
        assert_eq!(items.list_by_source("s1").await.unwrap().len(), 2);

        let history = scheduler.history("Scraper", "s1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].details.contains_key("scrape_summary"));
        assert!(history[0].details.contains_key("stale"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_scrape_warns_and_skips_reclaim() {
        let (pool, _scraper, scheduler) = setup().await;
        SqlxSourceRepository::new(pool)
            .save(&ScrapeSource::new("a1", "aws-prod", "aws"))
            .await
            .unwrap();

        let response = scheduler.run_now("a1").await.unwrap();
        assert_eq!(response.status, JobStatus::Warning);
        assert_eq!(response.success, 1);
        assert_eq!(response.failed, 1);
        assert_eq!(response.errors, vec!["vm-2: access denied".to_string()]);

        let history = scheduler.history("Scraper", "a1").await.unwrap();
        assert!(!history[0].details.contains_key("stale"));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_now_is_skipped_while_running() {
        let pool = memory_pool().await.unwrap();
        let scraper = Arc::new(BlockingScraper::default());
        let scheduler = Scheduler::new(
            EngineConfig::default(),
            pool.clone(),
            ScraperRegistry::new().with_scraper("kubernetes", scraper.clone()),
        );
        SqlxSourceRepository::new(pool)
            .save(&cluster("s1"))
            .await
            .unwrap();

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_now("s1").await })
        };
        scraper.started.notified().await;

        let second = scheduler.run_now("s1").await.unwrap();
        assert_eq!(second.status, JobStatus::Skipped);
        assert_eq!(second.total, 0);

        scraper.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_ne!(first.status, JobStatus::Skipped);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_now_unknown_source() {
        let (_pool, _scraper, scheduler) = setup().await;
        let err = scheduler.run_now("missing").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        scheduler.shutdown().await;
    }
}

mod event_tests {
    use super::*;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_source_events_drive_scheduling() {
        let (pool, _scraper, scheduler) = setup().await;
        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };
        wait_until(|| scheduler.job_keys().contains(&SOURCE_SYNC_JOB.to_string())).await;
        // The startup sync must be done or it could prune what the event adds.
        for _ in 0..200 {
            if !scheduler.history(SOURCE_SYNC_JOB, "").await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.events().subscriber_count(), 1);

        scheduler
            .events()
            .publish(SourceEvent::Upserted(cluster("s1")));
        wait_until(|| scheduler.job_keys().contains(&"s1".to_string())).await;

        let stored = SqlxSourceRepository::new(pool.clone()).get("s1").await.unwrap();
        assert_eq!(stored.name, "prod-cluster");

        scheduler.events().publish(SourceEvent::Deleted {
            source_id: "s1".to_string(),
        });
        wait_until(|| !scheduler.job_keys().contains(&"s1".to_string())).await;

        scheduler.shutdown().await;
        runner.await.unwrap().unwrap();

        let live = SqlxSourceRepository::new(pool).list().await.unwrap();
        assert!(live.is_empty());
    }
}
