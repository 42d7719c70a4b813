//! Point-in-time values, refreshed from their source before each export.

use super::counters::write_header;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, Ordering};

/// Last-written value.
#[derive(Debug)]
pub struct Gauge {
    name: &'static str,
    help: &'static str,
    value: AtomicI64,
}

impl Gauge {
    pub const fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicI64::new(0),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Append the gauge in Prometheus text format.
    pub fn write_prometheus(&self, out: &mut String) {
        write_header(out, self.name, self.help, "gauge");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_overwrites() {
        let gauge = Gauge::new("settlement_pending", "Buffered settlement events");
        assert_eq!(gauge.get(), 0);

        gauge.set(10);
        gauge.set(3);
        assert_eq!(gauge.get(), 3);

        let mut out = String::new();
        gauge.write_prometheus(&mut out);
        assert!(out.contains("# TYPE settlement_pending gauge"));
        assert!(out.ends_with("settlement_pending 3\n"));
    }
}
