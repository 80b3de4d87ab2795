//! In-process Prometheus instruments.
//!
//! These mirror what the aggregator records but in Prometheus form, so a run
//! can dump them in text exposition format at exit (`PRINT_METRICS=true`).
//! There is no scrape server.

use prometheus::{Encoder, Gauge, Histogram, IntCounter, IntCounterVec, Opts, TextEncoder};
use std::env;
use tracing::error;

use crate::outcome::RequestOutcome;

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "vu_loadtest".to_string());

    pub static ref ITERATIONS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("iterations_total", "Total number of completed VU iterations")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of HTTP requests by status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"]
        ).unwrap();

    pub static ref REQUEST_ERRORS_BY_CATEGORY: IntCounterVec =
        IntCounterVec::new(
            Opts::new("request_errors_total", "Number of failed HTTP requests by error category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    pub static ref CHECKS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("checks_total", "Check evaluations by check name and result")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["check", "result"]  // result: pass, fail
        ).unwrap();

    pub static ref ACTIVE_VUS: Gauge =
        Gauge::with_opts(
            Opts::new("active_vus", "Number of virtual users currently admitted")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "HTTP request latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all instruments with the default Prometheus registry.
///
/// Registering twice fails with a duplicate-collector error; callers that may
/// run more than once (tests) should guard with `std::sync::Once`.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(ITERATIONS_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    registry.register(Box::new(REQUEST_ERRORS_BY_CATEGORY.clone()))?;
    registry.register(Box::new(CHECKS_TOTAL.clone()))?;
    registry.register(Box::new(ACTIVE_VUS.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// Updates the instruments for one outcome.
pub fn observe_outcome(outcome: &RequestOutcome) {
    ITERATIONS_TOTAL.inc();
    REQUEST_DURATION_SECONDS.observe(outcome.latency.as_secs_f64());

    match outcome.status_code {
        Some(code) => {
            REQUEST_STATUS_CODES
                .with_label_values(&[status_code_label(code)])
                .inc();
        }
        None => REQUEST_STATUS_CODES.with_label_values(&["error"]).inc(),
    }

    let category = outcome
        .error
        .as_ref()
        .map(|e| e.category)
        .or_else(|| outcome.status_category());
    if let Some(category) = category {
        REQUEST_ERRORS_BY_CATEGORY
            .with_label_values(&[category.label()])
            .inc();
    }

    for check in &outcome.checks {
        let result = if check.passed { "pass" } else { "fail" };
        CHECKS_TOTAL.with_label_values(&[check.name.as_str(), result]).inc();
    }
}

/// Returns a static string label for common HTTP status codes.
///
/// Uncommon codes fall back to "other" to keep label cardinality bounded.
fn status_code_label(code: u16) -> &'static str {
    match code {
        200 => "200",
        201 => "201",
        204 => "204",
        301 => "301",
        302 => "302",
        304 => "304",
        400 => "400",
        401 => "401",
        403 => "403",
        404 => "404",
        408 => "408",
        429 => "429",
        500 => "500",
        502 => "502",
        503 => "503",
        504 => "504",
        _ => "other",
    }
}

/// Gathers and encodes the default registry as a string for final output.
pub fn gather_metrics_string() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return String::from("# ERROR ENCODING METRICS");
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "Metrics output is not valid UTF-8");
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}
