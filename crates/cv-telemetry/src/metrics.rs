use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metric names emitted by convoy components.
pub mod names {
    pub const CLAIMS_TOTAL: &str = "claims_total";
    pub const TASK_TRANSITIONS_TOTAL: &str = "task_transitions_total";
    pub const AGENTS_STALE_TOTAL: &str = "agents_stale_total";
    pub const EVENTS_INGESTED_TOTAL: &str = "events_ingested_total";
    pub const DLQ_CAPTURED_TOTAL: &str = "dlq_captured_total";
    pub const DLQ_RETRIES_TOTAL: &str = "dlq_retries_total";
    pub const ESCALATIONS_TOTAL: &str = "escalations_total";
    pub const NOTIFICATIONS_TOTAL: &str = "notifications_delivered_total";
    pub const ORCHESTRATOR_CYCLES_TOTAL: &str = "orchestrator_cycles_total";
    pub const API_REQUESTS_TOTAL: &str = "api_requests_total";
    pub const API_REQUEST_DURATION: &str = "api_request_duration_seconds";
    pub const TASK_EXECUTION_DURATION: &str = "task_execution_duration_seconds";
    pub const AGENTS_ACTIVE: &str = "agents_active";
    pub const TASKS_INCOMPLETE: &str = "tasks_incomplete";
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    sum_bits: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_bits: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum kept as bits for atomic add.
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum_bits.load(Ordering::Relaxed))
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Buckets in seconds, from sub-millisecond store calls to long task runs.
fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 60.0, 300.0,
    ]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs distinguishing members of a metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// `{key="value",...}`, with quotes and backslashes escaped.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("{k}=\"{escaped}\"")
            })
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

type Key = (String, Labels);

/// Process-wide counters, gauges and histograms.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<Key, AtomicU64>>,
    gauges: RwLock<AHashMap<Key, AtomicI64>>,
    histograms: RwLock<AHashMap<String, Histogram>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(&key) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        write(&self.gauges)
            .entry(key)
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges)
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with duration buckets on first use.
    pub fn record_histogram(&self, name: &str, value: f64) {
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(name) {
                h.observe(value);
                return;
            }
        }
        write(&self.histograms)
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str) -> u64 {
        read(&self.histograms)
            .get(name)
            .map(Histogram::count)
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut entries: Vec<(&Key, u64)> =
                map.iter().map(|(k, v)| (k, v.load(Ordering::Relaxed))).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            write_family(&mut out, "counter", &entries);
        }

        {
            let map = read(&self.gauges);
            let mut entries: Vec<(&Key, i64)> =
                map.iter().map(|(k, v)| (k, v.load(Ordering::Relaxed))).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            write_family(&mut out, "gauge", &entries);
        }

        {
            let map = read(&self.histograms);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let h = &map[name];
                out.push_str(&format!("# TYPE {name} histogram\n"));
                let mut cumulative = 0u64;
                for (i, boundary) in h.buckets.iter().enumerate() {
                    cumulative += h.counts[i].load(Ordering::Relaxed);
                    out.push_str(&format!("{name}_bucket{{le=\"{boundary}\"}} {cumulative}\n"));
                }
                out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} {}\n", h.count()));
                out.push_str(&format!("{name}_sum {}\n", h.sum()));
                out.push_str(&format!("{name}_count {}\n", h.count()));
            }
        }

        out
    }
}

fn write_family<V: std::fmt::Display>(out: &mut String, kind: &str, entries: &[(&Key, V)]) {
    let mut last: Option<&str> = None;
    for ((name, labels), value) in entries {
        if last != Some(name.as_str()) {
            out.push_str(&format!("# TYPE {name} {kind}\n"));
            last = Some(name.as_str());
        }
        out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// The process-wide collector.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsCollector::new();
        m.increment_counter("claims_total", &[("outcome", "won")]);
        m.increment_counter("claims_total", &[("outcome", "won")]);
        m.increment_counter("claims_total", &[("outcome", "conflict")]);
        assert_eq!(m.get_counter("claims_total", &[("outcome", "won")]), 2);
        assert_eq!(m.get_counter("claims_total", &[("outcome", "conflict")]), 1);
        assert_eq!(m.get_counter("claims_total", &[("outcome", "other")]), 0);
    }

    #[test]
    fn histogram_buckets_are_cumulative_in_export() {
        let m = MetricsCollector::new();
        m.record_histogram("x_seconds", 0.004);
        m.record_histogram("x_seconds", 0.3);
        let out = m.export_prometheus();
        assert!(out.contains("x_seconds_bucket{le=\"0.005\"} 1"));
        assert!(out.contains("x_seconds_bucket{le=\"0.5\"} 2"));
        assert!(out.contains("x_seconds_count 2"));
    }

    #[test]
    fn label_values_are_escaped() {
        let l = Labels::new(&[("path", "a\"b")]);
        assert_eq!(l.prometheus_str(), "{path=\"a\\\"b\"}");
    }
}
