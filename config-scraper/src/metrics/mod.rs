//! Engine metrics.
//!
//! Counters are kept per scrape source; time-in-queue is tracked as a
//! histogram. [`PrometheusExporter`] renders everything in text format.

mod collector;
mod prometheus;

pub use collector::{
    CONSUME_LAG_BUCKETS, EngineMetrics, LagHistogramSnapshot, MetricsSnapshot, SourceCounter,
};
pub use prometheus::PrometheusExporter;
