//! Prometheus text format export.

use std::fmt::Write;
use std::sync::Arc;

use super::collector::{CONSUME_LAG_BUCKETS, EngineMetrics};

/// Prometheus metrics exporter.
pub struct PrometheusExporter {
    metrics: Arc<EngineMetrics>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(metrics: Arc<EngineMetrics>) -> Self {
        Self::with_namespace(metrics, "config_scraper")
    }

    pub fn with_namespace(metrics: Arc<EngineMetrics>, namespace: impl Into<String>) -> Self {
        Self {
            metrics,
            namespace: namespace.into(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn export(&self) -> String {
        let snapshot = self.metrics.snapshot();
        let mut out = String::new();

        let mut by_counter: std::collections::BTreeMap<_, Vec<(&str, u64)>> = Default::default();
        for (source_id, counters) in &snapshot.counters {
            for (counter, value) in counters {
                by_counter
                    .entry(counter.as_str())
                    .or_default()
                    .push((source_id.as_str(), *value));
            }
        }
        for (name, samples) in by_counter {
            let full = format!("{}_{}_total", self.namespace, name);
            self.header(&mut out, &full, &format!("Total {}", name.replace('_', " ")), "counter");
            for (source_id, value) in samples {
                let _ = writeln!(out, "{full}{{source_id=\"{}\"}} {value}", escape(source_id));
            }
        }

        if !snapshot.queue_depth.is_empty() {
            let full = format!("{}_queue_depth", self.namespace);
            self.header(&mut out, &full, "Items waiting in the watch queue", "gauge");
            for (source_id, depth) in &snapshot.queue_depth {
                let _ = writeln!(out, "{full}{{source_id=\"{}\"}} {depth}", escape(source_id));
            }
        }

        if !snapshot.consume_lag.is_empty() {
            let full = format!("{}_consume_lag_seconds", self.namespace);
            self.header(&mut out, &full, "Time between enqueue and consumption", "histogram");
            for (source_id, lag) in &snapshot.consume_lag {
                let source_id = escape(source_id);
                for (bound, count) in CONSUME_LAG_BUCKETS.iter().zip(&lag.cumulative) {
                    let _ = writeln!(
                        out,
                        "{full}_bucket{{source_id=\"{source_id}\",le=\"{}\"}} {count}",
                        bound.as_secs()
                    );
                }
                let _ = writeln!(
                    out,
                    "{full}_bucket{{source_id=\"{source_id}\",le=\"+Inf\"}} {}",
                    lag.count
                );
                let _ = writeln!(
                    out,
                    "{full}_sum{{source_id=\"{source_id}\"}} {}",
                    lag.sum_ms as f64 / 1000.0
                );
                let _ = writeln!(out, "{full}_count{{source_id=\"{source_id}\"}} {}", lag.count);
            }
        }

        out
    }

    fn header(&self, out: &mut String, name: &str, help: &str, kind: &str) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} {kind}");
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SourceCounter;
    use std::time::Duration;

    #[test]
    fn test_export_counters_and_histogram() {
        let metrics = Arc::new(EngineMetrics::new());
        metrics.add("prod", SourceCounter::ItemsSaved, 4);
        metrics.observe_consume_lag("prod", Duration::from_secs(2));

        let text = PrometheusExporter::new(metrics).export();
        assert!(text.contains("# TYPE config_scraper_items_saved_total counter"));
        assert!(text.contains("config_scraper_items_saved_total{source_id=\"prod\"} 4"));
        assert!(text.contains("config_scraper_consume_lag_seconds_bucket{source_id=\"prod\",le=\"1\"} 0"));
        assert!(text.contains("config_scraper_consume_lag_seconds_bucket{source_id=\"prod\",le=\"5\"} 1"));
        assert!(text.contains("config_scraper_consume_lag_seconds_count{source_id=\"prod\"} 1"));
    }
}
