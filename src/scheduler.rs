//! Population scheduling.
//!
//! The scheduler owns the set of live virtual users. In fixed mode it admits
//! the whole population up front and waits for the shared budget to drain. In
//! staged mode it runs a control loop that, on every tick, compares the
//! interpolated target with the number of admitted users and spawns or
//! cancels the difference. Excess users are cancelled newest first.
//!
//! Every VU gets a child of the run's root cancellation token, so a run
//! timeout or external abort reaches all of them at once.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::IterationBudget;
use crate::errors::EngineError;
use crate::load_models::{LoadProfile, Stage};
use crate::vu::{VirtualUser, VuContext, VuReport};

/// Scheduler tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How often the staged control loop re-evaluates the target.
    pub tick_interval: Duration,
    /// Admission limit. Targets above it run degraded at this many VUs.
    pub max_vus: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(100),
            max_vus: None,
        }
    }
}

/// What happened during a scheduled run.
#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    pub vus_spawned: usize,
    pub peak_active: usize,
    /// VUs the admission limit held back. A shortfall that persists across
    /// control ticks is counted once; only growth adds to it.
    pub admissions_denied: usize,
    /// Total iterations completed across all VUs.
    pub iterations: u64,
    pub vu_reports: Vec<VuReport>,
}

/// A VU that is admitted and not yet cancelled.
struct AdmittedVu {
    id: usize,
    token: CancellationToken,
}

pub struct PopulationScheduler {
    profile: LoadProfile,
    config: SchedulerConfig,
    context: VuContext,
    root: CancellationToken,

    tasks: JoinSet<VuReport>,
    /// Admission order; the back is the most recently spawned.
    active: Vec<AdmittedVu>,
    next_id: usize,
    report: SchedulerReport,
    /// Target minus admitted VUs at the last denied admission.
    shortfall: usize,
    warned_exhaustion: bool,
    start: Instant,
}

impl PopulationScheduler {
    pub fn new(
        profile: LoadProfile,
        config: SchedulerConfig,
        context: VuContext,
        root: CancellationToken,
    ) -> Self {
        Self {
            profile,
            config,
            context,
            root,
            tasks: JoinSet::new(),
            active: Vec::new(),
            next_id: 0,
            report: SchedulerReport::default(),
            shortfall: 0,
            warned_exhaustion: false,
            start: Instant::now(),
        }
    }

    /// Runs the profile to completion and returns once every VU has stopped.
    pub async fn run(mut self) -> Result<SchedulerReport, EngineError> {
        self.profile.validate()?;
        self.start = Instant::now();

        match self.profile.clone() {
            LoadProfile::Fixed {
                concurrency,
                iterations,
            } => self.run_fixed(concurrency, iterations).await,
            LoadProfile::Staged { stages } => self.run_staged(&stages).await,
        }
    }

    async fn run_fixed(
        mut self,
        concurrency: usize,
        iterations: u64,
    ) -> Result<SchedulerReport, EngineError> {
        let budget = Arc::new(IterationBudget::new(iterations));
        self.context.budget = Some(Arc::clone(&budget));

        info!(
            concurrency = concurrency,
            iterations = iterations,
            "Starting fixed profile"
        );

        self.admit_up_to(concurrency);
        self.publish_concurrency();

        // VUs leave on their own when the budget runs dry (or on root cancellation).
        while let Some(joined) = self.tasks.join_next().await {
            let report = Self::unwrap_join(joined)?;
            self.active.retain(|vu| vu.id != report.vu_id);
            self.finish_vu(report);
            self.publish_concurrency();
        }

        let claimed = budget.claimed();
        if claimed != self.report.iterations {
            error!(
                claimed = claimed,
                completed = self.report.iterations,
                "Iteration budget and completed iterations disagree"
            );
            return Err(EngineError::Internal(format!(
                "{} iterations claimed but {} completed",
                claimed, self.report.iterations
            )));
        }
        info!(
            iterations = self.report.iterations,
            remaining = budget.remaining(),
            "Fixed profile finished"
        );
        Ok(self.report)
    }

    async fn run_staged(mut self, stages: &[Stage]) -> Result<SchedulerReport, EngineError> {
        let total = self.profile.total_duration().unwrap_or_default();
        info!(
            stages = stages.len(),
            total_secs = total.as_secs_f64(),
            max_target = self.profile.max_target(),
            "Starting staged profile"
        );

        let mut ticker = time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut current_stage: Option<usize> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => {
                    info!("Run cancelled, stopping staged profile early");
                    break;
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    // Only cancelled VUs finish in staged mode; collect them as they drain.
                    let report = Self::unwrap_join(joined)?;
                    self.finish_vu(report);
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let elapsed = self.start.elapsed();
            if elapsed >= total {
                break;
            }

            let stage = self.profile.stage_index_at(elapsed);
            if stage != current_stage {
                if let Some(index) = stage {
                    info!(
                        stage = index + 1,
                        duration_secs = stages[index].duration.as_secs_f64(),
                        target = stages[index].target,
                        "Entering stage"
                    );
                }
                current_stage = stage;
            }

            let target = self.profile.target_at(elapsed);
            self.scale_to(target, elapsed);
        }

        // Past the last stage: stop everyone and wait for in-flight work.
        let remaining = self.active.len();
        self.scale_to(0, self.start.elapsed());
        debug!(remaining = remaining, "Draining virtual users");

        while let Some(joined) = self.tasks.join_next().await {
            let report = Self::unwrap_join(joined)?;
            self.finish_vu(report);
        }

        info!(
            vus_spawned = self.report.vus_spawned,
            peak_active = self.report.peak_active,
            iterations = self.report.iterations,
            "Staged profile finished"
        );
        Ok(self.report)
    }

    /// Spawns or cancels VUs until the admitted count equals `target`
    /// (or the admission limit stops it).
    fn scale_to(&mut self, target: usize, elapsed: Duration) {
        let before = self.active.len();

        self.admit_up_to(target);

        while self.active.len() > target {
            if let Some(vu) = self.active.pop() {
                debug!(vu_id = vu.id, "Cancelling virtual user (ramp-down)");
                vu.token.cancel();
            }
        }

        if self.active.len() != before {
            self.publish_concurrency_at(elapsed);
        }
    }

    /// Admits VUs until `target` are active or the admission limit refuses one.
    fn admit_up_to(&mut self, target: usize) {
        while self.active.len() < target {
            if let Err(e) = self.admit() {
                self.note_denied(&e, target);
                let shortfall = target - self.active.len();
                self.report.admissions_denied += shortfall.saturating_sub(self.shortfall);
                self.shortfall = shortfall;
                return;
            }
        }
        self.shortfall = 0;
    }

    /// Admits one VU, or refuses with `ResourceExhaustion` at the admission limit.
    fn admit(&mut self) -> Result<(), EngineError> {
        if let Some(limit) = self.config.max_vus {
            if self.active.len() >= limit {
                return Err(EngineError::ResourceExhaustion(format!(
                    "admission limit of {} virtual users reached",
                    limit
                )));
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        let token = self.root.child_token();
        let vu = VirtualUser::new(id, self.context.clone(), token.clone());
        self.tasks.spawn(vu.run());
        self.active.push(AdmittedVu { id, token });
        self.report.vus_spawned += 1;

        debug!(vu_id = id, active = self.active.len(), "Virtual user admitted");
        Ok(())
    }

    fn note_denied(&mut self, error: &EngineError, wanted: usize) {
        if !self.warned_exhaustion {
            warn!(
                error = %error,
                wanted = wanted,
                running = self.active.len(),
                "Cannot admit more virtual users, continuing at reduced concurrency"
            );
            self.warned_exhaustion = true;
        }
    }

    fn finish_vu(&mut self, report: VuReport) {
        self.report.iterations += report.iterations;
        self.report.vu_reports.push(report);
    }

    fn publish_concurrency(&mut self) {
        let elapsed = self.start.elapsed();
        self.publish_concurrency_at(elapsed);
    }

    fn publish_concurrency_at(&mut self, elapsed: Duration) {
        let active = self.active.len();
        self.report.peak_active = self.report.peak_active.max(active);
        self.context.aggregator.record_concurrency(elapsed, active);
    }

    fn unwrap_join(joined: Result<VuReport, JoinError>) -> Result<VuReport, EngineError> {
        joined.map_err(|e| {
            error!(error = %e, "Virtual user task failed");
            EngineError::Internal(format!("virtual user task failed: {}", e))
        })
    }
}
