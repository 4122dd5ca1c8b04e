//! Resilience Metrics
//!
//! Every component receives an `Arc<dyn MetricsSink>` at construction time.
//! Sink calls are fire-and-forget: they never fail and never influence
//! routing decisions.
//!
//! Two sinks ship with the crate:
//! - [`NoopMetrics`] discards everything
//! - [`InMemoryMetrics`] keeps counters, gauges and latency histograms keyed
//!   by name and label set, and renders them in Prometheus text format

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

// ============================================================================
// Sink Interface
// ============================================================================

/// Destination for counters, histograms and gauges
pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], value: u64);

    fn record_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64);

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

/// Sink that drops every observation
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl NoopMetrics {
    /// Convenience for constructors that take `Arc<dyn MetricsSink>`
    pub fn shared() -> Arc<dyn MetricsSink> {
        Arc::new(Self)
    }
}

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)], _value: u64) {}

    fn record_histogram(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}

    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}

// ============================================================================
// Histogram for Latency Tracking
// ============================================================================

/// A histogram for tracking latency distributions
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds; the last bucket also absorbs overflow
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket boundaries
    ///
    /// An empty boundary list falls back to the default latency buckets.
    pub fn new(buckets: Vec<f64>) -> Self {
        if buckets.is_empty() {
            return Self::latency_default();
        }
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    /// Default latency buckets (in milliseconds)
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
            60000.0,
        ])
    }

    pub fn record(&self, value: f64) {
        let last = self.buckets.len() - 1;
        let bucket_idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(last);

        self.counts[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value.max(0.0) as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let counts: Vec<u64> = self
            .counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);

        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts,
            total,
            sum,
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Snapshot of histogram data
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub mean: f64,
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge holding the last written floating point value
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

// ============================================================================
// In-Memory Sink
// ============================================================================

/// Metric identity: name plus sorted label pairs
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn render_labels(&self) -> String {
        if self.labels.is_empty() {
            return String::new();
        }
        let pairs: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", pairs.join(","))
    }
}

/// Process-local metrics store
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<MetricKey, Counter>,
    gauges: DashMap<MetricKey, Gauge>,
    histograms: DashMap<MetricKey, Histogram>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter value (0 if never incremented)
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&MetricKey::new(name, labels))
            .map_or(0, |c| c.get())
    }

    /// Sum of a counter across all label sets
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|entry| entry.key().name == name)
            .map(|entry| entry.value().get())
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges
            .get(&MetricKey::new(name, labels))
            .map(|g| g.get())
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSnapshot> {
        self.histograms
            .get(&MetricKey::new(name, labels))
            .map(|h| h.snapshot())
    }

    /// Export as Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: BTreeMap<MetricKey, u64> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().get()))
            .collect();
        let gauges: BTreeMap<MetricKey, f64> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), e.value().get()))
            .collect();
        let histograms: BTreeMap<MetricKey, HistogramSnapshot> = self
            .histograms
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();

        let mut last_name = String::new();
        for (key, value) in &counters {
            if key.name != last_name {
                output.push_str(&format!("# TYPE {} counter\n", key.name));
                last_name.clone_from(&key.name);
            }
            output.push_str(&format!("{}{} {}\n", key.name, key.render_labels(), value));
        }

        last_name.clear();
        for (key, value) in &gauges {
            if key.name != last_name {
                output.push_str(&format!("# TYPE {} gauge\n", key.name));
                last_name.clone_from(&key.name);
            }
            output.push_str(&format!("{}{} {}\n", key.name, key.render_labels(), value));
        }

        last_name.clear();
        for (key, snap) in &histograms {
            if key.name != last_name {
                output.push_str(&format!("# TYPE {} histogram\n", key.name));
                last_name.clone_from(&key.name);
            }
            let labels = key.render_labels();
            output.push_str(&format!("{}_count{} {}\n", key.name, labels, snap.total));
            output.push_str(&format!("{}_sum{} {}\n", key.name, labels, snap.sum));
        }

        output
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        self.counters
            .entry(MetricKey::new(name, labels))
            .or_default()
            .add(value);
    }

    fn record_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .entry(MetricKey::new(name, labels))
            .or_insert_with(Histogram::latency_default)
            .record(value);
    }

    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges
            .entry(MetricKey::new(name, labels))
            .or_default()
            .set(value);
    }
}
