//! Percentile latency tracking using HDR Histogram.
//!
//! Latencies are stored in microseconds, from 1µs to 60s with 3 significant
//! digits. Values outside that range are clamped, so the histogram never
//! rejects a sample. Quantile queries are deterministic and monotonic in the
//! requested quantile.

use hdrhistogram::Histogram;
use serde::Serialize;
use std::time::Duration;
use tracing::warn;

const LOWEST_US: u64 = 1;
const HIGHEST_US: u64 = 60_000_000;
const SIGNIFICANT_DIGITS: u8 = 3;

/// Percentile statistics for a set of latency measurements (microseconds).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PercentileStats {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p99_9: u64,
}

impl PercentileStats {
    /// Format statistics as a compact table row.
    pub fn format_table_row(&self, label: &str) -> String {
        format!(
            "{:<20} {:>8} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2} {:>8.2}",
            label,
            self.count,
            us_to_ms(self.p50),
            us_to_ms(self.p90),
            us_to_ms(self.p95),
            us_to_ms(self.p99),
            us_to_ms(self.p99_9),
            self.mean / 1000.0,
            us_to_ms(self.max),
        )
    }

    /// Table header matching [`format_table_row`](Self::format_table_row).
    pub fn table_header() -> String {
        format!(
            "{:<20} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}\n{:<20} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8} {:>8}",
            "Label", "Count", "P50", "P90", "P95", "P99", "P99.9", "Mean", "Max",
            "", "", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)", "(ms)"
        )
    }
}

fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}

/// Latency histogram.
///
/// Not synchronized on its own; the aggregator owns it behind its lock.
pub struct LatencyHistogram {
    histogram: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let histogram = Histogram::new_with_bounds(LOWEST_US, HIGHEST_US, SIGNIFICANT_DIGITS)
            .expect("histogram bounds are valid constants");
        Self { histogram }
    }

    pub fn record(&mut self, latency: Duration) {
        let latency_us = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.record_us(latency_us);
    }

    pub fn record_us(&mut self, latency_us: u64) {
        let clamped = latency_us.clamp(LOWEST_US, HIGHEST_US);
        if let Err(e) = self.histogram.record(clamped) {
            warn!(
                latency_us = latency_us,
                error = %e,
                "Failed to record latency in histogram"
            );
        }
    }

    pub fn len(&self) -> u64 {
        self.histogram.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histogram.is_empty()
    }

    /// Value at `quantile` (0.0..=1.0) in microseconds; 0 when empty.
    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.histogram.value_at_quantile(quantile.clamp(0.0, 1.0))
    }

    /// Current statistics. Returns None if no samples have been recorded.
    pub fn stats(&self) -> Option<PercentileStats> {
        if self.is_empty() {
            return None;
        }

        let hist = &self.histogram;
        Some(PercentileStats {
            count: self.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p99_9: hist.value_at_quantile(0.999),
        })
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}
