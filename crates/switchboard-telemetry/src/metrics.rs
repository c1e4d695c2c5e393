use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Counter names recorded by the gateway.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "requests_total";
    pub const REQUESTS_FAILED_TOTAL: &str = "requests_failed_total";
    pub const REQUESTS_CANCELLED_TOTAL: &str = "requests_cancelled_total";
    pub const ATTEMPTS_TOTAL: &str = "attempts_total";
    pub const FAILOVERS_TOTAL: &str = "failovers_total";
    pub const CREDENTIAL_MISSES_TOTAL: &str = "credential_misses_total";
    pub const PROTOCOL_ERRORS_TOTAL: &str = "protocol_errors_total";
    pub const ATTEMPT_DURATION_MS: &str = "attempt_duration_ms";
}

/// Observations kept per histogram series for percentiles.
pub const HISTOGRAM_WINDOW: usize = 1024;

/// Summary statistics from a histogram. `count` and `sum` cover every
/// observation; percentiles cover the most recent [`HISTOGRAM_WINDOW`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
}

#[derive(Default)]
struct Histogram {
    count: u64,
    sum: f64,
    recent: VecDeque<f64>,
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.recent.len() == HISTOGRAM_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        if self.recent.is_empty() {
            return HistogramSummary::default();
        }
        let mut sorted: Vec<f64> = self.recent.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            p50: nearest_rank(&sorted, 0.50),
            p95: nearest_rank(&sorted, 0.95),
        }
    }
}

// `sorted` must be non-empty.
fn nearest_rank(sorted: &[f64], quantile: f64) -> f64 {
    let rank = (sorted.len() as f64 * quantile) as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// One counter value at snapshot time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: u64,
}

type Labels = Vec<(String, String)>;

/// Series identity. Labels are kept sorted by key so call-site order is
/// irrelevant.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
struct SeriesKey {
    name: String,
    labels: Labels,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Labels = labels
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

/// Map of series that are created on first use. The common path only takes
/// the read lock.
struct SeriesMap<T> {
    inner: RwLock<HashMap<SeriesKey, T>>,
}

impl<T: Default> SeriesMap<T> {
    fn with<R>(&self, key: SeriesKey, f: impl Fn(&T) -> R) -> R {
        if let Some(series) = self.inner.read().get(&key) {
            return f(series);
        }
        f(self.inner.write().entry(key).or_default())
    }

    fn get<R>(&self, key: &SeriesKey, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.read().get(key).map(f)
    }
}

impl<T> Default for SeriesMap<T> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

/// Thread-safe in-memory metrics recorder shared by every request.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: SeriesMap<AtomicU64>,
    histograms: SeriesMap<Mutex<Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.counters.with(SeriesKey::new(name, labels), |c| {
            c.fetch_add(n, Ordering::Relaxed);
        });
    }

    /// Current value of one labelled series; zero if never incremented.
    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&SeriesKey::new(name, labels), |c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .inner
            .read()
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.histograms
            .with(SeriesKey::new(name, labels), |h| h.lock().observe(value));
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        self.histograms
            .get(&SeriesKey::new(name, labels), |h| h.lock().summary())
            .unwrap_or_default()
    }

    /// All counters, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<CounterSample> {
        let counters = self.counters.inner.read();
        let mut keys: Vec<&SeriesKey> = counters.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| CounterSample {
                name: key.name.clone(),
                labels: key.labels.clone(),
                value: counters[key].load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsRecorder::new();
        m.counter_inc(names::ATTEMPTS_TOTAL, &[("provider", "openai")], 1);
        m.counter_inc(names::ATTEMPTS_TOTAL, &[("provider", "openai")], 2);
        m.counter_inc(names::ATTEMPTS_TOTAL, &[("provider", "anthropic")], 1);

        assert_eq!(m.counter_get(names::ATTEMPTS_TOTAL, &[("provider", "openai")]), 3);
        assert_eq!(m.counter_get(names::ATTEMPTS_TOTAL, &[("provider", "anthropic")]), 1);
        assert_eq!(m.counter_total(names::ATTEMPTS_TOTAL), 4);
        assert_eq!(m.counter_get(names::FAILOVERS_TOTAL, &[]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsRecorder::new();
        m.counter_inc("c", &[("a", "1"), ("b", "2")], 1);
        m.counter_inc("c", &[("b", "2"), ("a", "1")], 1);
        assert_eq!(m.counter_get("c", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn histogram_summary() {
        let m = MetricsRecorder::new();
        for v in [10.0, 20.0, 30.0, 40.0] {
            m.histogram_observe(names::ATTEMPT_DURATION_MS, &[], v);
        }
        let s = m.histogram_summary(names::ATTEMPT_DURATION_MS, &[]);
        assert_eq!(s.count, 4);
        assert_eq!(s.sum, 100.0);
        assert_eq!(s.p50, 30.0);
        assert_eq!(s.p95, 40.0);

        assert_eq!(m.histogram_summary("missing", &[]), HistogramSummary::default());
    }

    #[test]
    fn histogram_memory_is_bounded() {
        let m = MetricsRecorder::new();
        let total = HISTOGRAM_WINDOW * 3;
        for i in 0..total {
            // Early observations are large; the recent window is all ones.
            let v = if i < total - HISTOGRAM_WINDOW { 1000.0 } else { 1.0 };
            m.histogram_observe("latency", &[], v);
        }

        let key = SeriesKey::new("latency", &[]);
        let kept = m.histograms.get(&key, |h| h.lock().recent.len());
        assert_eq!(kept, Some(HISTOGRAM_WINDOW));

        let s = m.histogram_summary("latency", &[]);
        assert_eq!(s.count, total as u64);
        assert_eq!(s.p50, 1.0);
        assert_eq!(s.p95, 1.0);
    }

    #[test]
    fn snapshot_is_sorted() {
        let m = MetricsRecorder::new();
        m.counter_inc("b", &[], 1);
        m.counter_inc("a", &[], 5);
        let snap = m.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].name, "a");
        assert_eq!(snap[0].value, 5);
    }
}
