//! The virtual user loop.
//!
//! ```text
//! Idle -> Running -> (PacedWait -> Running)* -> Stopped
//! ```
//!
//! Each pass through `Running` claims an iteration, issues one request and
//! hands the outcome to the aggregator. Cancellation is only observed between
//! iterations and during the pacing wait, never while a request is in flight.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::aggregator::MetricsAggregator;
use crate::budget::IterationBudget;
use crate::errors::EngineError;
use crate::executor::RequestExecutor;
use crate::utils::parse_duration_string;

/// Delay between the end of one iteration and the start of the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Repeat immediately.
    #[default]
    None,

    Fixed(Duration),

    /// Uniformly random delay between min and max, inclusive.
    Random { min: Duration, max: Duration },
}

impl Pacing {
    /// Parses `"100ms"`, `"0.1s"`, or a range such as `"50ms-200ms"`.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Pacing::None);
        }

        let invalid = |e: String| EngineError::Config(format!("Invalid pacing '{}': {}", s, e));

        match s.split_once('-') {
            Some((min, max)) => {
                let min = parse_duration_string(min).map_err(invalid)?;
                let max = parse_duration_string(max).map_err(invalid)?;
                if min > max {
                    return Err(invalid("minimum is greater than maximum".to_string()));
                }
                Ok(Pacing::Random { min, max })
            }
            None => {
                let delay = parse_duration_string(s).map_err(invalid)?;
                if delay.is_zero() {
                    Ok(Pacing::None)
                } else {
                    Ok(Pacing::Fixed(delay))
                }
            }
        }
    }

    /// Calculate the delay to apply for the next wait.
    pub fn next_delay(&self) -> Duration {
        match self {
            Pacing::None => Duration::ZERO,
            Pacing::Fixed(delay) => *delay,
            Pacing::Random { min, max } => {
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;

                if min_ms >= max_ms {
                    return *min;
                }

                let random_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
                Duration::from_millis(random_ms)
            }
        }
    }
}

/// Lifecycle of one virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    Idle,
    Running,
    PacedWait,
    Stopped,
}

/// Why a virtual user reached `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shared iteration budget ran out.
    BudgetExhausted,
    /// The scheduler (ramp-down), the run timeout, or an abort cancelled it.
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::BudgetExhausted => f.write_str("budget exhausted"),
            StopReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Final report of a virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VuReport {
    pub vu_id: usize,
    pub iterations: u64,
    pub reason: StopReason,
}

/// Shared collaborators of every virtual user in a run.
#[derive(Clone)]
pub struct VuContext {
    pub executor: RequestExecutor,
    pub aggregator: Arc<MetricsAggregator>,
    /// Fixed profiles share one budget; staged VUs iterate until cancelled.
    pub budget: Option<Arc<IterationBudget>>,
    pub pacing: Pacing,
}

/// One simulated client.
pub struct VirtualUser {
    id: usize,
    iterations: u64,
    state: VuState,
    context: VuContext,
    cancel: CancellationToken,
}

impl VirtualUser {
    pub fn new(id: usize, context: VuContext, cancel: CancellationToken) -> Self {
        Self {
            id,
            iterations: 0,
            state: VuState::Idle,
            context,
            cancel,
        }
    }

    fn transition(&mut self, next: VuState) {
        trace!(vu_id = self.id, from = ?self.state, to = ?next, "VU state change");
        self.state = next;
    }

    /// Runs the loop to completion.
    pub async fn run(mut self) -> VuReport {
        debug!(vu_id = self.id, pacing = ?self.context.pacing, "Virtual user starting");

        let reason = loop {
            // Iteration boundary: the only place besides PacedWait where we stop.
            if self.cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            if let Some(budget) = &self.context.budget {
                if budget.try_claim().is_none() {
                    break StopReason::BudgetExhausted;
                }
            }

            self.transition(VuState::Running);
            // Not raced against cancellation: an in-flight request always completes.
            let outcome = self.context.executor.execute(self.id, self.iterations).await;
            self.context.aggregator.record(outcome);
            self.iterations += 1;

            let delay = self.context.pacing.next_delay();
            if !delay.is_zero() {
                self.transition(VuState::PacedWait);
                tokio::select! {
                    _ = self.cancel.cancelled() => break StopReason::Cancelled,
                    _ = time::sleep(delay) => {}
                }
            } else {
                // Let other tasks on this worker run between back-to-back requests.
                tokio::task::yield_now().await;
            }
        };

        self.transition(VuState::Stopped);
        debug!(
            vu_id = self.id,
            iterations = self.iterations,
            reason = %reason,
            "Virtual user stopped"
        );

        VuReport {
            vu_id: self.id,
            iterations: self.iterations,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fixed_pacing() {
        assert_eq!(
            Pacing::parse("0.1s").unwrap(),
            Pacing::Fixed(Duration::from_millis(100))
        );
        assert_eq!(
            Pacing::parse("250ms").unwrap(),
            Pacing::Fixed(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_parse_zero_and_empty_pacing() {
        assert_eq!(Pacing::parse("").unwrap(), Pacing::None);
        assert_eq!(Pacing::parse("0s").unwrap(), Pacing::None);
    }

    #[test]
    fn test_parse_random_pacing() {
        assert_eq!(
            Pacing::parse("50ms-200ms").unwrap(),
            Pacing::Random {
                min: Duration::from_millis(50),
                max: Duration::from_millis(200)
            }
        );
        assert!(Pacing::parse("2s-1s").is_err());
        assert!(Pacing::parse("fast").is_err());
    }

    #[test]
    fn test_random_delay_in_range() {
        let pacing = Pacing::Random {
            min: Duration::from_millis(10),
            max: Duration::from_millis(20),
        };
        for _ in 0..100 {
            let delay = pacing.next_delay();
            assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(20));
        }
    }

    #[test]
    fn test_degenerate_random_range() {
        let pacing = Pacing::Random {
            min: Duration::from_millis(30),
            max: Duration::from_millis(30),
        };
        assert_eq!(pacing.next_delay(), Duration::from_millis(30));
    }
}
