//! Prometheus metrics for access-service.
//!
//! Domain counters live in the default `prometheus` registry. HTTP request
//! metrics are emitted by the service-core middleware through the `metrics`
//! facade and rendered by the installed exporter recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use tracing::warn;

/// Handle of the `metrics` facade recorder; `None` when another recorder was
/// already installed in this process.
static HTTP_METRICS: OnceCell<Option<PrometheusHandle>> = OnceCell::new();

/// Access request lifecycle transitions by outcome.
pub static ACCESS_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "access_requests_total",
        "Access request lifecycle transitions",
        &["transition"] // created, approval_step, approved, rejected, expired
    )
    .expect("Failed to register access_requests_total")
});

/// Oracle calls by operation and outcome.
pub static ORACLE_CALLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "access_oracle_calls_total",
        "Authorization oracle calls",
        &["operation", "status"]
    )
    .expect("Failed to register oracle_calls_total")
});

/// Audit appends by outcome.
pub static AUDIT_APPENDS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "access_audit_appends_total",
        "Audit trail appends",
        &["status"]
    )
    .expect("Failed to register audit_appends_total")
});

/// Biometric verification outcomes.
pub static BIOMETRIC_CHECKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "access_biometric_checks_total",
        "Biometric verification outcomes",
        &["outcome"] // verified, rejected, unavailable
    )
    .expect("Failed to register biometric_checks_total")
});

/// Notification dispatch outcomes.
pub static NOTIFICATIONS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "access_notifications_total",
        "Notification dispatch outcomes",
        &["status"]
    )
    .expect("Failed to register notifications_total")
});

/// Error counter for alerting.
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "access_errors_total",
        "Total number of errors by kind",
        &["kind"]
    )
    .expect("Failed to register errors_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "access_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    HTTP_METRICS.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "HTTP metrics recorder not installed");
            None
        }
    });
    Lazy::force(&ACCESS_REQUESTS_TOTAL);
    Lazy::force(&ORACLE_CALLS_TOTAL);
    Lazy::force(&AUDIT_APPENDS_TOTAL);
    Lazy::force(&BIOMETRIC_CHECKS_TOTAL);
    Lazy::force(&NOTIFICATIONS_TOTAL);
    Lazy::force(&ERRORS_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format: HTTP series first, then the
/// domain counters.
pub fn get_metrics() -> String {
    let mut output = HTTP_METRICS
        .get()
        .and_then(|handle| handle.as_ref())
        .map(|handle| handle.render())
        .unwrap_or_default();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Ok(domain) = encoder.encode_to_string(&metric_families) {
        output.push_str(&domain);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_exposition() {
        init_metrics();
        ACCESS_REQUESTS_TOTAL.with_label_values(&["created"]).inc();
        let text = get_metrics();
        assert!(text.contains("access_requests_total"));
    }
}
