//! Engine configuration and source update events.
//!
//! Settings come from environment variables (a `.env` file is loaded by the
//! binary first). Anything missing falls back to a default; anything present
//! but malformed is a configuration error and stops startup.

pub mod events;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::{RetryPolicy, parse_duration};
use crate::watch::ConsumerConfig;
use crate::{Error, Result};

pub use events::{SourceEvent, SourceEventBroadcaster};

/// Default concurrent full scrapes per source type.
pub const DEFAULT_TYPE_CONCURRENCY: &[(&str, usize)] = &[
    ("aws", 2),
    ("azure", 2),
    ("azuredevops", 5),
    ("file", 10),
    ("gcp", 2),
    ("githubactions", 5),
    ("http", 10),
    ("kubernetes", 3),
    ("kubernetesfile", 3),
    ("slack", 5),
    ("sql", 10),
    ("terraform", 10),
    ("trivy", 1),
];

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub database_url: String,
    /// Concurrent full scrapes across all sources.
    pub global_concurrency: usize,
    /// Concurrent full scrapes per source type.
    pub type_concurrency: BTreeMap<String, usize>,
    /// Schedule used when a source does not set one.
    pub default_schedule: String,
    /// Schedules firing more often than this are clamped.
    pub min_schedule: Duration,
    pub sync_interval: Duration,
    pub consume_interval: Duration,
    pub queue_capacity: usize,
    pub drain_max: usize,
    pub redelivery_delay: Duration,
    pub max_redeliveries: u32,
    pub stale_default_timeout: Duration,
    pub stale_sweep_interval: Duration,
    pub changes_max_count: usize,
    pub changes_max_window: Duration,
    pub dedup_window: Duration,
    /// Change rows not observed for this long are deleted.
    pub change_retention: Duration,
    /// Soft-deleted items are hard-deleted after this long.
    pub item_retention: Duration,
    pub log_dir: Option<String>,
    /// Rolled log files older than this are deleted.
    pub log_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:config-scraper.db?mode=rwc".to_string(),
            global_concurrency: 12,
            type_concurrency: DEFAULT_TYPE_CONCURRENCY
                .iter()
                .map(|(t, n)| (t.to_string(), *n))
                .collect(),
            default_schedule: "@every 60m".to_string(),
            min_schedule: Duration::from_secs(29),
            sync_interval: Duration::from_secs(600),
            consume_interval: Duration::from_secs(15),
            queue_capacity: 5_000,
            drain_max: 5_000,
            redelivery_delay: Duration::from_secs(30),
            max_redeliveries: 5,
            stale_default_timeout: Duration::from_secs(24 * 3600),
            stale_sweep_interval: Duration::from_secs(3600),
            changes_max_count: 100,
            changes_max_window: Duration::from_secs(4 * 3600),
            dedup_window: Duration::from_secs(3600),
            change_retention: Duration::from_secs(60 * 86_400),
            item_retention: Duration::from_secs(7 * 86_400),
            log_dir: None,
            log_retention: Duration::from_secs(7 * 86_400),
        }
    }
}

impl EngineConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let duration = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                None => Ok(default),
                Some(v) => parse_duration(&v)
                    .map_err(|e| Error::config(format!("{key}: {e}"))),
            }
        };
        let number = |key: &str, default: usize| -> Result<usize> {
            match get(key) {
                None => Ok(default),
                Some(v) => v
                    .parse::<usize>()
                    .map_err(|_| Error::config(format!("{key}: '{v}' is not a number"))),
            }
        };

        let defaults = Self::default();

        let mut type_concurrency = defaults.type_concurrency.clone();
        for (source_type, limit) in type_concurrency.iter_mut() {
            let key = format!("SCRAPER_{}_CONCURRENCY", source_type.to_ascii_uppercase());
            *limit = number(&key, *limit)?;
        }

        let config = Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            global_concurrency: number("SCRAPER_CONCURRENCY", defaults.global_concurrency)?,
            type_concurrency,
            default_schedule: get("SCRAPER_DEFAULT_SCHEDULE").unwrap_or(defaults.default_schedule),
            min_schedule: duration("SCRAPER_MIN_SCHEDULE", defaults.min_schedule)?,
            sync_interval: duration("SCRAPER_SYNC_INTERVAL", defaults.sync_interval)?,
            consume_interval: duration("WATCH_CONSUME_INTERVAL", defaults.consume_interval)?,
            queue_capacity: number("WATCH_QUEUE_CAPACITY", defaults.queue_capacity)?,
            drain_max: number("WATCH_DRAIN_MAX", defaults.drain_max)?,
            redelivery_delay: duration("WATCH_REDELIVERY_DELAY", defaults.redelivery_delay)?,
            max_redeliveries: number("WATCH_MAX_REDELIVERIES", defaults.max_redeliveries as usize)?
                as u32,
            stale_default_timeout: duration("STALE_DEFAULT_TIMEOUT", defaults.stale_default_timeout)?,
            stale_sweep_interval: duration("STALE_SWEEP_INTERVAL", defaults.stale_sweep_interval)?,
            changes_max_count: number("CHANGES_MAX_COUNT", defaults.changes_max_count)?,
            changes_max_window: duration("CHANGES_MAX_WINDOW", defaults.changes_max_window)?,
            dedup_window: duration("CHANGES_DEDUP_WINDOW", defaults.dedup_window)?,
            change_retention: duration("CHANGE_RETENTION", defaults.change_retention)?,
            item_retention: duration("ITEM_RETENTION", defaults.item_retention)?,
            log_dir: get("LOG_DIR"),
            log_retention: duration("LOG_RETENTION", defaults.log_retention)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_concurrency == 0 {
            return Err(Error::config("SCRAPER_CONCURRENCY must be at least 1"));
        }
        if let Some((source_type, _)) = self.type_concurrency.iter().find(|(_, n)| **n == 0) {
            return Err(Error::config(format!(
                "concurrency for source type '{source_type}' must be at least 1"
            )));
        }
        if self.queue_capacity == 0 || self.drain_max == 0 {
            return Err(Error::config("watch queue capacity and drain size must be at least 1"));
        }
        if self.consume_interval.is_zero() || self.sync_interval.is_zero() {
            return Err(Error::config("consume and sync intervals must be positive"));
        }
        Ok(())
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            drain_max: self.drain_max,
            redelivery_delay: self.redelivery_delay,
            max_redeliveries: self.max_redeliveries,
            dependency_retry: RetryPolicy::default(),
            ..ConsumerConfig::default()
        }
    }
}
