//! Counter metrics for monotonically increasing values.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Append the counter in Prometheus text format.
    pub fn write_prometheus(&self, out: &mut String) {
        write_header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// A counter with labels for dimensional metrics.
#[derive(Debug)]
pub struct LabeledCounter<const N: usize> {
    name: &'static str,
    help: &'static str,
    label_names: [&'static str; N],
    counters: RwLock<HashMap<[String; N], AtomicU64>>,
}

impl<const N: usize> LabeledCounter<N> {
    /// Create a new labeled counter.
    pub fn new(name: &'static str, help: &'static str, label_names: [&'static str; N]) -> Self {
        Self {
            name,
            help,
            label_names,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Increment the counter with the given labels.
    pub fn inc(&self, labels: [&str; N]) {
        self.inc_by(labels, 1);
    }

    /// Increment the counter by a specific amount with the given labels.
    pub fn inc_by(&self, labels: [&str; N], n: u64) {
        let key: [String; N] = labels.map(|s| s.to_string());

        {
            let counters = self.counters.read();
            if let Some(counter) = counters.get(&key) {
                counter.fetch_add(n, Ordering::Relaxed);
                return;
            }
        }

        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Get the value for specific labels.
    pub fn get(&self, labels: [&str; N]) -> u64 {
        let key: [String; N] = labels.map(|s| s.to_string());
        self.counters
            .read()
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Sum over every label set whose label at `index` equals `value`.
    pub fn sum_where(&self, index: usize, value: &str) -> u64 {
        self.counters
            .read()
            .iter()
            .filter(|(k, _)| k.get(index).is_some_and(|l| l == value))
            .map(|(_, v)| v.load(Ordering::Relaxed))
            .sum()
    }

    /// Get all values with their labels, sorted by label.
    pub fn get_all(&self) -> Vec<([String; N], u64)> {
        let mut all: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        all.sort();
        all
    }

    /// Append every label set in Prometheus text format.
    pub fn write_prometheus(&self, out: &mut String) {
        write_header(out, self.name, self.help, "counter");
        for (labels, value) in self.get_all() {
            let _ = writeln!(
                out,
                "{}{{{}}} {}",
                self.name,
                render_labels(&self.label_names, &labels),
                value
            );
        }
    }
}

pub(crate) fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

/// Render `a="x",b="y"`.
pub(crate) fn render_labels(names: &[&str], values: &[String]) -> String {
    names
        .iter()
        .zip(values)
        .map(|(name, value)| format!("{}=\"{}\"", name, value))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "A test counter");

        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.inc_by(5);
        assert_eq!(counter.get(), 6);

        let mut out = String::new();
        counter.write_prometheus(&mut out);
        assert!(out.contains("# TYPE test_counter counter"));
        assert!(out.contains("test_counter 6"));
    }

    #[test]
    fn test_labeled_counter() {
        let counter = LabeledCounter::<2>::new(
            "inventory_requests_total",
            "Requests by outcome",
            ["operation", "outcome"],
        );

        counter.inc(["lock", "success"]);
        counter.inc(["lock", "success"]);
        counter.inc(["lock", "failure"]);
        counter.inc(["release", "success"]);

        assert_eq!(counter.get(["lock", "success"]), 2);
        assert_eq!(counter.get(["lock", "failure"]), 1);
        assert_eq!(counter.get(["deduct", "success"]), 0);
        assert_eq!(counter.sum_where(0, "lock"), 3);
        assert_eq!(counter.sum_where(1, "success"), 3);
        assert_eq!(counter.get_all().len(), 3);

        let mut out = String::new();
        counter.write_prometheus(&mut out);
        assert!(out.contains("inventory_requests_total{operation=\"lock\",outcome=\"success\"} 2"));
    }
}
