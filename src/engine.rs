//! Wires configuration, client, scheduler and aggregator into one run.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::{MetricsAggregator, RunSummary};
use crate::client::{build_client, ClientBuildResult};
use crate::config::Config;
use crate::errors::EngineError;
use crate::executor::RequestExecutor;
use crate::scheduler::PopulationScheduler;
use crate::vu::VuContext;

/// Exit code for a run that completed but went over its failure threshold.
pub const EXIT_THRESHOLD_EXCEEDED: i32 = 2;

pub struct Engine {
    config: Config,
    aggregator: Arc<MetricsAggregator>,
    root: CancellationToken,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self::with_aggregator(config, Arc::new(MetricsAggregator::new()))
    }

    /// Uses a caller-supplied aggregator, e.g. one that retains every outcome.
    pub fn with_aggregator(config: Config, aggregator: Arc<MetricsAggregator>) -> Self {
        Self {
            config,
            aggregator,
            root: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn aggregator(&self) -> &Arc<MetricsAggregator> {
        &self.aggregator
    }

    /// Cancelling this token stops every virtual user at its next boundary.
    pub fn cancel_token(&self) -> CancellationToken {
        self.root.clone()
    }

    /// Runs the configured profile and returns the final summary.
    ///
    /// Configuration problems are reported before any request is sent.
    pub async fn run(&self) -> Result<RunSummary, EngineError> {
        self.config.profile.validate()?;

        let ClientBuildResult {
            client,
            parsed_headers,
        } = build_client(&self.config.client)?;
        self.config.print_summary(&parsed_headers);

        let executor = RequestExecutor::new(
            client,
            self.config.endpoint.clone(),
            self.config.checks.clone(),
        );
        let context = VuContext {
            executor,
            aggregator: Arc::clone(&self.aggregator),
            budget: None,
            pacing: self.config.pacing,
        };

        // Stops the reporter and the timeout watchdog once the scheduler returns.
        let background = self.root.child_token();
        let reporter = self
            .config
            .summary_interval
            .map(|interval| self.aggregator.spawn_periodic_report(interval, background.clone()));
        let watchdog = self
            .config
            .run_timeout
            .map(|timeout| self.spawn_timeout(timeout, background.clone()));

        let scheduler = PopulationScheduler::new(
            self.config.profile.clone(),
            self.config.scheduler,
            context,
            self.root.clone(),
        );
        let result = scheduler.run().await;

        background.cancel();
        for handle in [reporter, watchdog].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task did not shut down cleanly");
            }
        }

        let report = result?;
        let summary = self.aggregator.summary();

        info!(
            vus_spawned = report.vus_spawned,
            admissions_denied = report.admissions_denied,
            iterations = report.iterations,
            requests = summary.total_requests,
            failures = summary.failures,
            failure_rate = summary.failure_rate,
            "Run finished"
        );

        Ok(summary)
    }

    fn spawn_timeout(&self, timeout: time::Duration, done: CancellationToken) -> JoinHandle<()> {
        let root = self.root.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = time::sleep(timeout) => {
                    warn!(timeout_secs = timeout.as_secs_f64(), "Run timeout reached, cancelling virtual users");
                    root.cancel();
                }
            }
        })
    }
}

/// Process exit code for a completed run.
pub fn exit_code(summary: &RunSummary, threshold: Option<f64>) -> i32 {
    if summary.exceeds_threshold(threshold) {
        EXIT_THRESHOLD_EXCEEDED
    } else {
        0
    }
}
