//! Prometheus metrics for allocation-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

/// Counter for HTTP requests by route and status.
pub static HTTP_REQUESTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_http_requests_total",
        "Total number of HTTP requests",
        &["route", "status"]
    )
    .expect("Failed to register HTTP_REQUESTS")
});

/// Histogram for ledger query duration.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "allocation_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Counter for payments processed, by outcome.
pub static PAYMENTS_PROCESSED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_payments_processed_total",
        "Total number of payments processed",
        &["outcome"]
    )
    .expect("Failed to register PAYMENTS_PROCESSED")
});

/// Counter for candidates generated, by match type.
pub static CANDIDATES_GENERATED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_candidates_generated_total",
        "Total number of candidate matches generated",
        &["match_type"]
    )
    .expect("Failed to register CANDIDATES_GENERATED")
});

/// Counter for optimistic commit conflicts.
pub static COMMIT_CONFLICTS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_commit_conflicts_total",
        "Total number of ledger commit conflicts",
        &["operation"]
    )
    .expect("Failed to register COMMIT_CONFLICTS")
});

/// Counter for reversals.
pub static REVERSALS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_reversals_total",
        "Total number of allocation reversals",
        &["status"]
    )
    .expect("Failed to register REVERSALS")
});

/// Counter for errors.
pub static ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "allocation_errors_total",
        "Total number of errors",
        &["error_type"]
    )
    .expect("Failed to register ERRORS")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&HTTP_REQUESTS);
    Lazy::force(&DB_QUERY_DURATION);
    Lazy::force(&PAYMENTS_PROCESSED);
    Lazy::force(&CANDIDATES_GENERATED);
    Lazy::force(&COMMIT_CONFLICTS);
    Lazy::force(&REVERSALS);
    Lazy::force(&ERRORS);
}

/// Get all metrics as Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

pub fn record_http_request(route: &str, status: &str) {
    HTTP_REQUESTS.with_label_values(&[route, status]).inc();
}

pub fn record_payment_outcome(outcome: &str) {
    PAYMENTS_PROCESSED.with_label_values(&[outcome]).inc();
}

pub fn record_candidate(match_type: &str) {
    CANDIDATES_GENERATED.with_label_values(&[match_type]).inc();
}

pub fn record_commit_conflict(operation: &str) {
    COMMIT_CONFLICTS.with_label_values(&[operation]).inc();
}

pub fn record_reversal(status: &str) {
    REVERSALS.with_label_values(&[status]).inc();
}

/// Record an error.
pub fn record_error(error_type: &str) {
    ERRORS.with_label_values(&[error_type]).inc();
}
