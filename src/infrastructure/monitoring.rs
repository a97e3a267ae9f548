// Monitoring and Observability
// Process-wide metric registry with the stable shardis metric names

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Activity source name for all spans emitted by this crate
pub const ACTIVITY_SOURCE: &str = "Shardis";

pub const METRIC_ROUTE_LATENCY: &str = "shardis.route.latency";
pub const METRIC_QUERY_MERGE_LATENCY: &str = "shardis.query.merge.latency";
pub const METRIC_HEALTH_PROBE_LATENCY: &str = "shardis.health.probe.latency";
pub const METRIC_HEALTH_SHARD_SKIPPED: &str = "shardis.health.shard.skipped";
pub const METRIC_HEALTH_SHARD_RECOVERED: &str = "shardis.health.shard.recovered";

const SAMPLE_WINDOW: usize = 1024;

/// Histogram state for latency metrics (milliseconds)
#[derive(Debug, Clone, Default)]
struct HistogramMetrics {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    buckets: HashMap<&'static str, u64>,
    samples: Vec<f64>,
}

impl HistogramMetrics {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        let bucket = if value < 10.0 {
            "0-10ms"
        } else if value < 50.0 {
            "10-50ms"
        } else if value < 100.0 {
            "50-100ms"
        } else if value < 500.0 {
            "100-500ms"
        } else {
            "500ms+"
        };
        *self.buckets.entry(bucket).or_insert(0) += 1;

        if self.samples.len() >= SAMPLE_WINDOW {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            p50: self.percentile(50.0),
            p95: self.percentile(95.0),
            p99: self.percentile(99.0),
        }
    }
}

/// Read-only view of a histogram at a point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Registry of histograms and counters. Recording is lock-cheap and callable
/// from sync contexts (stream guards record on drop).
#[derive(Debug, Default)]
pub struct MetricsCollector {
    histograms: Mutex<HashMap<String, HistogramMetrics>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a histogram sample (milliseconds for the latency metrics)
    pub fn record_histogram(&self, name: &str, value: f64) {
        let mut histograms = self
            .histograms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        histograms.entry(name.to_string()).or_default().record(value);
    }

    /// Increment a counter by `delta`
    pub fn increment_counter(&self, name: &str, delta: u64) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counters.entry(name.to_string()).or_insert(0) += delta;
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.get(name).copied().unwrap_or(0)
    }

    pub fn histogram_snapshot(&self, name: &str) -> HistogramSnapshot {
        let histograms = self
            .histograms
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        histograms
            .get(name)
            .map(|h| h.snapshot())
            .unwrap_or_default()
    }
}

static METRICS: OnceCell<Arc<MetricsCollector>> = OnceCell::new();

/// Install the default process-wide metrics collector (idempotent)
pub fn initialize_metrics_default() -> Arc<MetricsCollector> {
    METRICS
        .get_or_init(|| Arc::new(MetricsCollector::new()))
        .clone()
}

/// Process-wide metrics collector
pub fn metrics() -> Arc<MetricsCollector> {
    initialize_metrics_default()
}

/// Initialize the tracing subscriber for hosts that have not set one up
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    info!("shardis tracing initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_percentiles() {
        let collector = MetricsCollector::new();
        for v in 1..=100 {
            collector.record_histogram("test.latency", v as f64);
        }
        let snap = collector.histogram_snapshot("test.latency");
        assert_eq!(snap.count, 100);
        assert!(snap.p50 >= 49.0 && snap.p50 <= 52.0);
        assert!(snap.p95 >= 94.0 && snap.p95 <= 97.0);
        assert_eq!(snap.max, 100.0);
    }

    #[test]
    fn test_counters() {
        let collector = MetricsCollector::new();
        collector.increment_counter(METRIC_HEALTH_SHARD_SKIPPED, 1);
        collector.increment_counter(METRIC_HEALTH_SHARD_SKIPPED, 2);
        assert_eq!(collector.counter_value(METRIC_HEALTH_SHARD_SKIPPED), 3);
        assert_eq!(collector.counter_value("missing"), 0);
    }
}
