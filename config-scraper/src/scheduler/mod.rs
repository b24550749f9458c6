//! Scheduling: schedule expressions, the cron registry, scrape concurrency
//! limits and the [`Scheduler`] that ties sources to jobs.

pub mod concurrency;
pub mod registry;
pub mod schedule;
pub mod service;

pub use concurrency::{ScrapeLimits, ScrapePermit};
pub use registry::JobRegistry;
pub use schedule::Schedule;
pub use service::{
    CHANGE_RETENTION_JOB, CLEANUP_CHANGES_JOB, CLEANUP_ITEMS_JOB, RunNowResponse, SOURCE_SYNC_JOB, Scheduler,
    SyncReport, consume_job_key, reclaim_job_key,
};
