//! In-process metrics for the inventory engine.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      EngineMetrics                           │
//! │  ┌──────────────────┐  ┌──────────────┐  ┌──────────────┐  │
//! │  │  Counters        │  │   Gauges     │  │  Histograms  │  │
//! │  │ - requests       │  │ - pending    │  │ - latency by │  │
//! │  │ - failures/kind  │  │ - cache tier │  │   operation  │  │
//! │  │ - compensations  │  │ - hot keys   │  │ - flush time │  │
//! │  │ - settlement     │  │              │  │              │  │
//! │  └──────────────────┘  └──────────────┘  └──────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing here exports; callers scrape [`EngineMetrics::to_prometheus`] or
//! read a [`MetricsSnapshot`].

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, LabeledHistogram, LATENCY_BUCKETS};

use crate::cache::CacheTierStats;
use crate::error::{Error, Result};
use std::fmt;
use std::time::Duration;
use tracing::{error, warn};

/// p99 latency above which an operation is reported as degraded.
pub const P99_LATENCY_LIMIT: Duration = Duration::from_millis(80);

/// Success rate below which the engine is reported as inaccurate.
pub const MIN_SUCCESS_RATE: f64 = 0.9999;

/// Engine operations tracked by metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Initialize,
    Lock,
    Deduct,
    Release,
    Query,
    Expire,
}

impl Operation {
    /// Every operation, in reporting order.
    pub const ALL: [Operation; 6] = [
        Operation::Initialize,
        Operation::Lock,
        Operation::Deduct,
        Operation::Release,
        Operation::Query,
        Operation::Expire,
    ];

    /// Label used in metric series.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Initialize => "initialize",
            Operation::Lock => "lock",
            Operation::Deduct => "deduct",
            Operation::Release => "release",
            Operation::Query => "query",
            Operation::Expire => "expire",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metrics for the inventory engine.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Requests by operation and outcome.
    pub requests: LabeledCounter<2>,
    /// Failures by operation and error kind.
    pub failures: LabeledCounter<2>,
    /// Latency by operation.
    pub latency: LabeledHistogram<1>,

    /// Partial allocations rolled back after a failed lock.
    pub compensations: Counter,
    /// Rollbacks that themselves failed.
    pub compensation_failures: Counter,
    /// Reservations released by expiry.
    pub reservations_expired: Counter,

    /// Coalesced shard updates applied by the settlement pipeline.
    pub settlement_batches: Counter,
    /// Settlement events applied.
    pub settlement_events: Counter,
    /// Shard updates that failed and were re-buffered.
    pub settlement_failures: Counter,
    /// Reservations dropped from settlement on a permanent failure and
    /// returned to held.
    pub settlement_dropped: Counter,
    /// Events waiting in settlement buffers.
    pub settlement_pending: Gauge,
    /// Time spent per flush.
    pub flush_latency: LabeledHistogram<0>,

    /// Local tier hits, mirrored from the cache tier.
    pub cache_local_hits: Gauge,
    /// Shared tier hits, mirrored from the cache tier.
    pub cache_shared_hits: Gauge,
    /// Ledger loads after both tiers missed.
    pub cache_loads: Gauge,
    /// Shared tier errors.
    pub cache_shared_errors: Gauge,
    /// Entries in the local tier.
    pub cache_local_entries: Gauge,
    /// Keys currently classified hot.
    pub hot_keys: Gauge,
    /// Hotspot promotions since start.
    pub hotspot_promotions: Gauge,
}

impl EngineMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            requests: LabeledCounter::new(
                "inventory_requests_total",
                "Inventory requests by outcome",
                ["operation", "outcome"],
            ),
            failures: LabeledCounter::new(
                "inventory_failures_total",
                "Inventory failures by error kind",
                ["operation", "reason"],
            ),
            latency: LabeledHistogram::new(
                "inventory_latency_seconds",
                "Inventory operation latency",
                ["operation"],
                LATENCY_BUCKETS,
            ),
            compensations: Counter::new(
                "inventory_compensations_total",
                "Partial allocations rolled back",
            ),
            compensation_failures: Counter::new(
                "inventory_compensation_failures_total",
                "Rollbacks that failed",
            ),
            reservations_expired: Counter::new(
                "inventory_reservations_expired_total",
                "Reservations released by expiry",
            ),
            settlement_batches: Counter::new(
                "settlement_batches_total",
                "Coalesced shard settlements applied",
            ),
            settlement_events: Counter::new(
                "settlement_events_total",
                "Settlement events applied",
            ),
            settlement_failures: Counter::new(
                "settlement_failures_total",
                "Shard settlements re-buffered after failure",
            ),
            settlement_dropped: Counter::new(
                "settlement_dropped_total",
                "Reservations returned to held after a permanent settlement failure",
            ),
            settlement_pending: Gauge::new(
                "settlement_pending_events",
                "Events waiting in settlement buffers",
            ),
            flush_latency: LabeledHistogram::new(
                "settlement_flush_seconds",
                "Settlement flush duration",
                [],
                LATENCY_BUCKETS,
            ),
            cache_local_hits: Gauge::new("cache_local_hits", "Local tier hits"),
            cache_shared_hits: Gauge::new("cache_shared_hits", "Shared tier hits"),
            cache_loads: Gauge::new("cache_loads", "Ledger loads after cache misses"),
            cache_shared_errors: Gauge::new("cache_shared_errors", "Shared tier errors"),
            cache_local_entries: Gauge::new("cache_local_entries", "Entries in the local tier"),
            hot_keys: Gauge::new("hotspot_keys", "Keys classified hot"),
            hotspot_promotions: Gauge::new("hotspot_promotions", "Hotspot promotions"),
        }
    }

    /// Record the outcome of an operation.
    pub fn record<T>(&self, op: Operation, result: &Result<T>, latency: Duration) {
        match result {
            Ok(_) => self.record_success(op, latency),
            Err(e) => self.record_failure(op, e, latency),
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self, op: Operation, latency: Duration) {
        self.requests.inc([op.as_str(), "success"]);
        self.latency.observe_duration([op.as_str()], latency);
    }

    /// Record a failed operation.
    pub fn record_failure(&self, op: Operation, error: &Error, latency: Duration) {
        self.requests.inc([op.as_str(), "failure"]);
        self.failures.inc([op.as_str(), error.kind()]);
        self.latency.observe_duration([op.as_str()], latency);
    }

    /// Mirror cache tier statistics into gauges.
    pub fn update_cache_stats(&self, stats: &CacheTierStats, hot_keys: usize, promotions: u64) {
        self.cache_local_hits.set(stats.local_hits as i64);
        self.cache_shared_hits.set(stats.shared_hits as i64);
        self.cache_loads.set(stats.loads as i64);
        self.cache_shared_errors.set(stats.shared_errors as i64);
        self.cache_local_entries.set(stats.local_entries as i64);
        self.hot_keys.set(hot_keys as i64);
        self.hotspot_promotions.set(promotions as i64);
    }

    /// Success rate across request-serving operations, or 1.0 with no samples.
    pub fn success_rate(&self) -> f64 {
        let success = self.requests.sum_where(1, "success");
        let failure = self.requests.sum_where(1, "failure");
        let total = success + failure;
        if total == 0 {
            1.0
        } else {
            success as f64 / total as f64
        }
    }

    /// Check latency and accuracy thresholds, logging every violation.
    pub fn check_health(&self) -> HealthReport {
        let mut issues = Vec::new();

        for op in [Operation::Lock, Operation::Deduct, Operation::Release] {
            let Some(snapshot) = self.latency.snapshot([op.as_str()]) else {
                continue;
            };
            let p99 = Duration::from_secs_f64(snapshot.percentile(99.0));
            if p99 > P99_LATENCY_LIMIT {
                warn!(
                    operation = %op,
                    p99_ms = p99.as_millis() as u64,
                    "Inventory operation latency degraded"
                );
                issues.push(HealthIssue::SlowOperation { operation: op, p99 });
            }
        }

        let rate = self.success_rate();
        if rate < MIN_SUCCESS_RATE {
            error!(
                success_rate = rate * 100.0,
                "Inventory operation success rate too low"
            );
            issues.push(HealthIssue::LowSuccessRate { rate });
        }

        HealthReport { issues }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = |op: Operation, outcome: &str| self.requests.get([op.as_str(), outcome]);
        MetricsSnapshot {
            lock_success: count(Operation::Lock, "success"),
            lock_failure: count(Operation::Lock, "failure"),
            deduct_success: count(Operation::Deduct, "success"),
            deduct_failure: count(Operation::Deduct, "failure"),
            release_success: count(Operation::Release, "success"),
            release_failure: count(Operation::Release, "failure"),
            insufficient_stock: self.failures.sum_where(1, "insufficient_stock"),
            lock_timeouts: self.failures.sum_where(1, "lock_timeout"),
            compensations: self.compensations.get(),
            reservations_expired: self.reservations_expired.get(),
            settlement_events: self.settlement_events.get(),
            settlement_pending: self.settlement_pending.get(),
            success_rate: self.success_rate(),
            lock_latency: self.latency.snapshot([Operation::Lock.as_str()]),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        self.requests.write_prometheus(&mut output);
        self.failures.write_prometheus(&mut output);
        self.latency.write_prometheus(&mut output);

        for counter in [
            &self.compensations,
            &self.compensation_failures,
            &self.reservations_expired,
            &self.settlement_batches,
            &self.settlement_events,
            &self.settlement_failures,
            &self.settlement_dropped,
        ] {
            counter.write_prometheus(&mut output);
        }

        for gauge in [
            &self.settlement_pending,
            &self.cache_local_hits,
            &self.cache_shared_hits,
            &self.cache_loads,
            &self.cache_shared_errors,
            &self.cache_local_entries,
            &self.hot_keys,
            &self.hotspot_promotions,
        ] {
            gauge.write_prometheus(&mut output);
        }

        self.flush_latency.write_prometheus(&mut output);

        output
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// One threshold violation found by [`EngineMetrics::check_health`].
#[derive(Debug, Clone, PartialEq)]
pub enum HealthIssue {
    SlowOperation { operation: Operation, p99: Duration },
    LowSuccessRate { rate: f64 },
}

/// Result of a health check.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    /// Whether no threshold was violated.
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// A snapshot of engine metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub lock_success: u64,
    pub lock_failure: u64,
    pub deduct_success: u64,
    pub deduct_failure: u64,
    pub release_success: u64,
    pub release_failure: u64,
    pub insufficient_stock: u64,
    pub lock_timeouts: u64,
    pub compensations: u64,
    pub reservations_expired: u64,
    pub settlement_events: u64,
    pub settlement_pending: i64,
    pub success_rate: f64,
    pub lock_latency: Option<HistogramSnapshot>,
}

impl MetricsSnapshot {
    /// Get average lock latency in milliseconds.
    pub fn avg_lock_latency_ms(&self) -> f64 {
        self.lock_latency
            .as_ref()
            .map(|s| s.mean() * 1000.0)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_outcomes() {
        let metrics = EngineMetrics::new();

        metrics.record(Operation::Lock, &Ok(()), Duration::from_millis(1));
        metrics.record::<()>(
            Operation::Lock,
            &Err(Error::InsufficientStock {
                requested: 2,
                available: 1,
            }),
            Duration::from_millis(2),
        );
        metrics.record(Operation::Release, &Ok(()), Duration::from_millis(1));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.lock_success, 1);
        assert_eq!(snapshot.lock_failure, 1);
        assert_eq!(snapshot.release_success, 1);
        assert_eq!(snapshot.insufficient_stock, 1);
        assert!((snapshot.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(snapshot.lock_latency.unwrap().count, 2);
    }

    #[test]
    fn test_health_flags_slow_operations() {
        let metrics = EngineMetrics::new();
        for _ in 0..10 {
            metrics.record_success(Operation::Lock, Duration::from_millis(200));
        }

        let report = metrics.check_health();
        assert!(!report.is_healthy());
        assert!(matches!(
            report.issues[0],
            HealthIssue::SlowOperation {
                operation: Operation::Lock,
                ..
            }
        ));
    }

    #[test]
    fn test_health_flags_low_success_rate() {
        let metrics = EngineMetrics::new();
        metrics.record_success(Operation::Lock, Duration::from_millis(1));
        metrics.record_failure(
            Operation::Lock,
            &Error::LockTimeout { key: "k".into() },
            Duration::from_millis(1),
        );

        let report = metrics.check_health();
        assert_eq!(report.issues.len(), 1);
        assert!(matches!(report.issues[0], HealthIssue::LowSuccessRate { .. }));
    }

    #[test]
    fn test_healthy_when_fast_and_accurate() {
        let metrics = EngineMetrics::new();
        for _ in 0..100 {
            metrics.record_success(Operation::Lock, Duration::from_millis(2));
        }
        assert!(metrics.check_health().is_healthy());
        assert_eq!(EngineMetrics::new().success_rate(), 1.0);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = EngineMetrics::new();
        metrics.record_success(Operation::Lock, Duration::from_millis(1));
        metrics.compensations.inc();

        let output = metrics.to_prometheus();

        assert!(output.contains("inventory_requests_total{operation=\"lock\",outcome=\"success\"} 1"));
        assert!(output.contains("inventory_compensations_total 1"));
        assert!(output.contains("# TYPE settlement_pending_events gauge"));
        assert!(output.contains("HELP"));
    }
}
