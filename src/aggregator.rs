//! Outcome aggregation.
//!
//! Every virtual user pushes its `RequestOutcome`s into one shared
//! [`MetricsAggregator`]. Ingestion goes through a single mutex over an
//! append-only state, so concurrent writers can neither interleave partial
//! updates nor lose or double-count an outcome. `summary()` can be called at
//! any time and returns a snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics;
use crate::outcome::{CheckStatus, RequestOutcome};
use crate::percentiles::{LatencyHistogram, PercentileStats};

/// Pass/fail tallies for one named check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckCounts {
    pub passed: u64,
    pub failed: u64,
}

/// Active VU count at a point in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencySample {
    pub elapsed: Duration,
    pub active: usize,
}

/// End-of-run (or periodic) statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Completed iterations; each iteration issues exactly one request.
    pub total_requests: u64,
    pub successful: u64,
    /// Network errors plus responses that failed a check
    pub failures: u64,
    pub check_failures: u64,
    pub network_errors: u64,
    pub failure_rate: f64,
    /// Latency statistics in microseconds; None when nothing was recorded.
    pub latency: Option<PercentileStats>,
    pub peak_concurrency: usize,
    pub elapsed_secs: f64,
    pub checks: BTreeMap<String, CheckCounts>,
    pub status_codes: BTreeMap<u16, u64>,
    pub errors_by_category: BTreeMap<String, u64>,
    #[serde(skip)]
    pub timeline: Vec<ConcurrencySample>,
}

impl RunSummary {
    fn latency_at(&self, pick: impl Fn(&PercentileStats) -> u64) -> Duration {
        self.latency
            .as_ref()
            .map(|stats| Duration::from_micros(pick(stats)))
            .unwrap_or_default()
    }

    pub fn p50(&self) -> Duration {
        self.latency_at(|s| s.p50)
    }

    pub fn p90(&self) -> Duration {
        self.latency_at(|s| s.p90)
    }

    pub fn p99(&self) -> Duration {
        self.latency_at(|s| s.p99)
    }

    /// True when a threshold is configured and the failure rate is above it.
    pub fn exceeds_threshold(&self, threshold: Option<f64>) -> bool {
        threshold.is_some_and(|limit| self.failure_rate > limit)
    }

    /// Human-readable summary block.
    pub fn format_text(&self) -> String {
        let mut out = String::new();
        out.push_str("--- RUN SUMMARY ---\n");
        out.push_str(&format!("  Duration:          {:.2}s\n", self.elapsed_secs));
        out.push_str(&format!("  Requests:          {}\n", self.total_requests));
        out.push_str(&format!("  Successful:        {}\n", self.successful));
        out.push_str(&format!(
            "  Failures:          {} ({:.2}%)\n",
            self.failures,
            self.failure_rate * 100.0
        ));
        out.push_str(&format!("    check failures:  {}\n", self.check_failures));
        out.push_str(&format!("    network errors:  {}\n", self.network_errors));
        out.push_str(&format!("  Peak concurrency:  {}\n", self.peak_concurrency));

        match &self.latency {
            Some(stats) => {
                out.push('\n');
                out.push_str(&PercentileStats::table_header());
                out.push('\n');
                out.push_str(&"-".repeat(92));
                out.push('\n');
                out.push_str(&stats.format_table_row("requests"));
                out.push('\n');
            }
            None => out.push_str("\n  No latency data recorded.\n"),
        }

        if !self.checks.is_empty() {
            out.push_str("\n  Checks:\n");
            for (name, counts) in &self.checks {
                let total = counts.passed + counts.failed;
                let mark = if counts.failed == 0 { "✓" } else { "✗" };
                out.push_str(&format!(
                    "    {} {:<30} {}/{} passed\n",
                    mark, name, counts.passed, total
                ));
            }
        }

        if !self.status_codes.is_empty() {
            out.push_str("\n  Status codes:\n");
            for (code, count) in &self.status_codes {
                out.push_str(&format!("    {}: {}\n", code, count));
            }
        }

        if !self.errors_by_category.is_empty() {
            out.push_str("\n  Errors by category:\n");
            for (category, count) in &self.errors_by_category {
                out.push_str(&format!("    {}: {}\n", category, count));
            }
        }

        out.push_str("--- END OF RUN SUMMARY ---\n");
        out
    }
}

#[derive(Default)]
struct AggregatorState {
    total: u64,
    successful: u64,
    check_failures: u64,
    network_errors: u64,
    histogram: LatencyHistogram,
    checks: BTreeMap<String, CheckCounts>,
    status_codes: BTreeMap<u16, u64>,
    errors_by_category: BTreeMap<String, u64>,
    peak_concurrency: usize,
    timeline: Vec<ConcurrencySample>,
    outcomes: Vec<RequestOutcome>,
}

/// Thread-safe sink for request outcomes.
pub struct MetricsAggregator {
    state: Mutex<AggregatorState>,
    retain_outcomes: bool,
    started: Instant,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AggregatorState::default()),
            retain_outcomes: false,
            started: Instant::now(),
        }
    }

    /// Also keeps every raw outcome, retrievable with [`outcomes`](Self::outcomes).
    pub fn with_retained_outcomes() -> Self {
        Self {
            retain_outcomes: true,
            ..Self::new()
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        // Counters stay consistent across a panicking writer.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ingests one outcome.
    pub fn record(&self, outcome: RequestOutcome) {
        metrics::observe_outcome(&outcome);

        let mut state = self.lock();
        state.total += 1;
        state.histogram.record(outcome.latency);

        match outcome.check_result {
            CheckStatus::Pass => state.successful += 1,
            CheckStatus::Fail => state.check_failures += 1,
            CheckStatus::Error => state.network_errors += 1,
        }

        if let Some(code) = outcome.status_code {
            *state.status_codes.entry(code).or_default() += 1;
        }

        let category = outcome
            .error
            .as_ref()
            .map(|e| e.category)
            .or_else(|| outcome.status_category());
        if let Some(category) = category {
            *state
                .errors_by_category
                .entry(category.label().to_string())
                .or_default() += 1;
        }

        for check in &outcome.checks {
            let counts = state.checks.entry(check.name.clone()).or_default();
            if check.passed {
                counts.passed += 1;
            } else {
                counts.failed += 1;
            }
        }

        if self.retain_outcomes {
            state.outcomes.push(outcome);
        }
    }

    /// Records the scheduler's active VU count at `elapsed` into the run.
    pub fn record_concurrency(&self, elapsed: Duration, active: usize) {
        metrics::ACTIVE_VUS.set(active as f64);
        let mut state = self.lock();
        state.peak_concurrency = state.peak_concurrency.max(active);
        if state.timeline.last().map(|s| s.active) != Some(active) {
            state.timeline.push(ConcurrencySample { elapsed, active });
        }
    }

    /// Number of outcomes ingested so far.
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    /// Copies of the retained outcomes (empty unless created with retention).
    pub fn outcomes(&self) -> Vec<RequestOutcome> {
        self.lock().outcomes.clone()
    }

    /// Snapshot of the statistics so far.
    pub fn summary(&self) -> RunSummary {
        let elapsed_secs = self.started.elapsed().as_secs_f64();
        let state = self.lock();
        let failures = state.check_failures + state.network_errors;
        let failure_rate = if state.total == 0 {
            0.0
        } else {
            failures as f64 / state.total as f64
        };

        RunSummary {
            total_requests: state.total,
            successful: state.successful,
            failures,
            check_failures: state.check_failures,
            network_errors: state.network_errors,
            failure_rate,
            latency: state.histogram.stats(),
            peak_concurrency: state.peak_concurrency,
            elapsed_secs,
            checks: state.checks.clone(),
            status_codes: state.status_codes.clone(),
            errors_by_category: state.errors_by_category.clone(),
            timeline: state.timeline.clone(),
        }
    }

    /// Logs a one-line summary every `interval` until `token` is cancelled.
    pub fn spawn_periodic_report(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let summary = aggregator.summary();
                        info!(
                            requests = summary.total_requests,
                            failures = summary.failures,
                            p50_ms = summary.p50().as_secs_f64() * 1000.0,
                            p99_ms = summary.p99().as_secs_f64() * 1000.0,
                            peak_vus = summary.peak_concurrency,
                            elapsed_secs = summary.elapsed_secs,
                            "Progress"
                        );
                    }
                }
            }
        })
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
