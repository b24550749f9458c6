//! config-scraper library crate.
//!
//! Scrape orchestration and incremental change detection for configuration
//! inventories. The binary wires these modules together; integration tests
//! drive them directly.

pub mod changes;
pub mod clock;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod metrics;
pub mod persist;
pub mod retention;
pub mod scheduler;
pub mod scrapers;
pub mod stale;
pub mod watch;

pub use error::{Error, Result};
