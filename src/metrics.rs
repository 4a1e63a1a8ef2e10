//! Operational metrics with Prometheus.
//!
//! NOTE: labels stay aggregate (assignment source, operation result) —
//! never user ids or test ids, which would explode cardinality.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Crate-local metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    /// Assignments resolved, by source: sticky, computed, forced
    pub static ref ASSIGNMENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("prayog_assignments_total", "Assignments resolved"),
        &["source"]
    ).unwrap();

    /// Results appended to the log, by outcome
    pub static ref RESULTS_RECORDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("prayog_results_recorded_total", "Result records appended"),
        &["result"]
    ).unwrap();

    /// Tests stopped by the auto-stop safety valve
    pub static ref TESTS_AUTO_STOPPED_TOTAL: IntCounter = IntCounter::new(
        "prayog_tests_auto_stopped_total",
        "Tests stopped automatically"
    ).unwrap();

    /// Statistical analysis duration
    pub static ref ANALYSIS_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "prayog_analysis_duration_seconds",
            "Result-log analysis duration"
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5])
    ).unwrap();
}

/// Register all metrics with the crate registry. Safe to call once at
/// startup; later calls return the registry's AlreadyReg error, which
/// callers can ignore.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    METRICS_REGISTRY.register(Box::new(ASSIGNMENTS_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(RESULTS_RECORDED_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(TESTS_AUTO_STOPPED_TOTAL.clone()))?;
    METRICS_REGISTRY.register(Box::new(ANALYSIS_DURATION.clone()))?;
    Ok(())
}
