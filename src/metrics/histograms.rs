//! Histogram metrics for latency distributions.

use super::counters::{render_labels, write_header};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Latency buckets (in seconds) for inventory operations.
pub const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.08, 0.1, 0.25, 0.5, 1.0, 3.0,
];

/// A histogram for measuring distributions.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    bucket_counts: Vec<AtomicU64>,
    sum: AtomicU64, // f64 bits
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds.
    pub fn with_buckets(mut buckets: Vec<f64>) -> Self {
        buckets.sort_by(|a, b| a.total_cmp(b));
        let bucket_counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets,
            bucket_counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Observe a value.
    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);

        let mut current = self.sum.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match self.sum.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        // Cumulative buckets
        for (i, &upper) in self.buckets.iter().enumerate() {
            if value <= upper {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Observe a duration in seconds.
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    /// Get a snapshot of the histogram data.
    pub fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: f64::from_bits(self.sum.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of histogram data.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Bucket upper bounds.
    pub buckets: Vec<f64>,
    /// Count of observations <= each bound.
    pub bucket_counts: Vec<u64>,
    /// Sum of all observations.
    pub sum: f64,
    /// Total count of observations.
    pub count: u64,
}

impl HistogramSnapshot {
    /// Calculate the mean.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Estimate a percentile by interpolating within the matching bucket.
    ///
    /// Observations above the last bound are reported as the last bound.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }

        let target = ((self.count as f64 * p / 100.0).ceil() as u64).max(1);
        let mut prev_count = 0;
        let mut prev_bound = 0.0;

        for (&bound, &count) in self.buckets.iter().zip(&self.bucket_counts) {
            if count >= target {
                let in_bucket = count - prev_count;
                if in_bucket == 0 {
                    return bound;
                }
                let position = (target - prev_count) as f64 / in_bucket as f64;
                return prev_bound + position * (bound - prev_bound);
            }
            prev_count = count;
            prev_bound = bound;
        }

        self.buckets.last().copied().unwrap_or(0.0)
    }
}

/// A histogram per label set.
#[derive(Debug)]
pub struct LabeledHistogram<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    buckets: Vec<f64>,
    histograms: RwLock<HashMap<[String; N], Histogram>>,
}

impl<const N: usize> LabeledHistogram<N> {
    /// Create a labeled histogram with the given buckets.
    pub fn new(
        name: &'static str,
        help: &'static str,
        label_names: [&'static str; N],
        buckets: &[f64],
    ) -> Self {
        Self {
            name,
            help,
            label_names,
            buckets: buckets.to_vec(),
            histograms: RwLock::new(HashMap::new()),
        }
    }

    /// Observe a duration with the given labels.
    pub fn observe_duration(&self, labels: [&str; N], duration: Duration) {
        let key: [String; N] = labels.map(|s| s.to_string());

        {
            let histograms = self.histograms.read();
            if let Some(h) = histograms.get(&key) {
                h.observe_duration(duration);
                return;
            }
        }

        self.histograms
            .write()
            .entry(key)
            .or_insert_with(|| Histogram::with_buckets(self.buckets.clone()))
            .observe_duration(duration);
    }

    /// Get a snapshot for specific labels.
    pub fn snapshot(&self, labels: [&str; N]) -> Option<HistogramSnapshot> {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.histograms.read().get(&key).map(|h| h.snapshot())
    }

    /// Get all snapshots with their labels, sorted by label.
    pub fn get_all(&self) -> Vec<([String; N], HistogramSnapshot)> {
        let mut all: Vec<_> = self
            .histograms
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Append every label set in Prometheus text format.
    pub fn write_prometheus(&self, out: &mut String) {
        write_header(out, self.name, self.help, "histogram");
        for (labels, snap) in self.get_all() {
            let rendered = render_labels(&self.label_names, &labels);
            let prefix = if rendered.is_empty() {
                String::new()
            } else {
                format!("{},", rendered)
            };
            for (bound, count) in snap.buckets.iter().zip(&snap.bucket_counts) {
                let _ = writeln!(
                    out,
                    "{}_bucket{{{}le=\"{}\"}} {}",
                    self.name, prefix, bound, count
                );
            }
            let _ = writeln!(
                out,
                "{}_bucket{{{}le=\"+Inf\"}} {}",
                self.name, prefix, snap.count
            );
            let _ = writeln!(out, "{}_sum{{{}}} {}", self.name, rendered, snap.sum);
            let _ = writeln!(out, "{}_count{{{}}} {}", self.name, rendered, snap.count);
        }
    }
}
