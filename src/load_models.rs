use tokio::time::Duration;

use crate::errors::EngineError;
use crate::utils::parse_duration_string;

/// One ramp segment: move the active VU count to `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Represents the two population models a run can use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadProfile {
    /// A constant population of `concurrency` VUs sharing one budget of `iterations`.
    /// The run ends when the budget is spent.
    Fixed { concurrency: usize, iterations: u64 },

    /// Ordered ramp segments. VUs iterate until the scheduler cancels them.
    /// The count starts at 0 and is linearly interpolated within each stage.
    Staged { stages: Vec<Stage> },
}

impl LoadProfile {
    /// Checks the profile's invariants.
    ///
    /// Durations are non-negative by construction. A fixed profile needs at
    /// least one VU, and a staged profile at least one stage.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            LoadProfile::Fixed { concurrency, .. } => {
                if *concurrency == 0 {
                    return Err(EngineError::Config(
                        "Fixed profile requires concurrency > 0".to_string(),
                    ));
                }
                Ok(())
            }
            LoadProfile::Staged { stages } => {
                if stages.is_empty() {
                    return Err(EngineError::Config(
                        "Staged profile requires at least one stage".to_string(),
                    ));
                }
                if stages.iter().all(|s| s.duration.is_zero()) {
                    return Err(EngineError::Config(
                        "Staged profile must last longer than zero seconds".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Total planned duration. None for fixed profiles, which end on budget exhaustion.
    pub fn total_duration(&self) -> Option<Duration> {
        match self {
            LoadProfile::Fixed { .. } => None,
            LoadProfile::Staged { stages } => Some(stages.iter().map(|s| s.duration).sum()),
        }
    }

    /// Highest VU count the profile asks for at any point.
    pub fn max_target(&self) -> usize {
        match self {
            LoadProfile::Fixed { concurrency, .. } => *concurrency,
            LoadProfile::Staged { stages } => stages.iter().map(|s| s.target).max().unwrap_or(0),
        }
    }

    /// Calculates the target VU count at `elapsed` since the start of the run.
    ///
    /// Fixed profiles always return `concurrency`. Staged profiles interpolate
    /// linearly from the previous stage's target and round to the nearest VU;
    /// past the end, the last stage's target holds.
    pub fn target_at(&self, elapsed: Duration) -> usize {
        match self {
            LoadProfile::Fixed { concurrency, .. } => *concurrency,
            LoadProfile::Staged { stages } => match Self::locate(stages, elapsed) {
                StagePosition::Within {
                    from,
                    to,
                    into_stage,
                    stage_duration,
                } => Self::linear_interpolate(from, to, into_stage, stage_duration),
                StagePosition::Finished { last_target } => last_target,
            },
        }
    }

    /// Inclusive bounds `(low, high)` on the active VU count at `elapsed`:
    /// the previous and current stage targets of the segment containing it.
    pub fn bounds_at(&self, elapsed: Duration) -> (usize, usize) {
        match self {
            LoadProfile::Fixed { concurrency, .. } => (0, *concurrency),
            LoadProfile::Staged { stages } => match Self::locate(stages, elapsed) {
                StagePosition::Within { from, to, .. } => (from.min(to), from.max(to)),
                StagePosition::Finished { last_target } => (0, last_target),
            },
        }
    }

    /// Index of the stage active at `elapsed`, if any.
    pub fn stage_index_at(&self, elapsed: Duration) -> Option<usize> {
        let LoadProfile::Staged { stages } = self else {
            return None;
        };
        let mut stage_end = Duration::ZERO;
        for (index, stage) in stages.iter().enumerate() {
            stage_end += stage.duration;
            if elapsed < stage_end {
                return Some(index);
            }
        }
        None
    }

    fn locate(stages: &[Stage], elapsed: Duration) -> StagePosition {
        let mut from = 0;
        let mut stage_start = Duration::ZERO;

        for stage in stages {
            let stage_end = stage_start + stage.duration;
            if elapsed < stage_end {
                return StagePosition::Within {
                    from,
                    to: stage.target,
                    into_stage: elapsed - stage_start,
                    stage_duration: stage.duration,
                };
            }
            from = stage.target;
            stage_start = stage_end;
        }

        StagePosition::Finished { last_target: from }
    }

    fn linear_interpolate(from: usize, to: usize, elapsed: Duration, duration: Duration) -> usize {
        if duration.is_zero() {
            return to;
        }
        let progress = (elapsed.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0);
        let value = from as f64 + (to as f64 - from as f64) * progress;
        (value.round() as usize).clamp(from.min(to), from.max(to))
    }
}

enum StagePosition {
    Within {
        from: usize,
        to: usize,
        into_stage: Duration,
        stage_duration: Duration,
    },
    Finished {
        last_target: usize,
    },
}

/// Parses a stage list such as `"10s:50,10s:200,20s:600,10s:0"`.
pub fn parse_stages_string(s: &str) -> Result<Vec<Stage>, EngineError> {
    let mut stages = Vec::new();

    for (index, part) in s.split(',').enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let (duration_str, target_str) = part.split_once(':').ok_or_else(|| {
            EngineError::Config(format!(
                "Stage {} ('{}') must be in the form 'duration:target', e.g. '10s:50'",
                index + 1,
                part
            ))
        })?;

        let duration = parse_duration_string(duration_str).map_err(|e| {
            EngineError::Config(format!("Stage {} has an invalid duration: {}", index + 1, e))
        })?;
        let target: usize = target_str.trim().parse().map_err(|_| {
            EngineError::Config(format!(
                "Stage {} has an invalid target '{}': must be a non-negative integer",
                index + 1,
                target_str.trim()
            ))
        })?;

        stages.push(Stage::new(duration, target));
    }

    if stages.is_empty() {
        return Err(EngineError::Config(
            "Stage list is empty".to_string(),
        ));
    }

    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn ramp() -> LoadProfile {
        LoadProfile::Staged {
            stages: vec![
                Stage::new(secs(10), 50),
                Stage::new(secs(10), 200),
                Stage::new(secs(10), 0),
            ],
        }
    }

    #[test]
    fn fixed_target_is_constant() {
        let profile = LoadProfile::Fixed {
            concurrency: 8,
            iterations: 100,
        };
        assert_eq!(profile.target_at(Duration::ZERO), 8);
        assert_eq!(profile.target_at(secs(3600)), 8);
        assert_eq!(profile.total_duration(), None);
    }

    #[test]
    fn staged_interpolates_linearly() {
        let profile = ramp();
        assert_eq!(profile.target_at(Duration::ZERO), 0);
        assert_eq!(profile.target_at(secs(5)), 25);
        assert_eq!(profile.target_at(secs(10)), 50);
        assert_eq!(profile.target_at(secs(15)), 125);
        assert_eq!(profile.target_at(secs(25)), 100);
        assert_eq!(profile.target_at(secs(30)), 0);
        assert_eq!(profile.target_at(secs(300)), 0);
    }

    #[test]
    fn zero_duration_stage_jumps_immediately() {
        let profile = LoadProfile::Staged {
            stages: vec![Stage::new(Duration::ZERO, 10), Stage::new(secs(10), 10)],
        };
        assert_eq!(profile.target_at(Duration::ZERO), 10);
        assert_eq!(profile.target_at(secs(4)), 10);
    }

    #[test]
    fn bounds_cover_interpolated_target() {
        let profile = ramp();
        for ms in (0..=32_000).step_by(250) {
            let elapsed = Duration::from_millis(ms);
            let (low, high) = profile.bounds_at(elapsed);
            let target = profile.target_at(elapsed);
            assert!(low <= target && target <= high, "t={:?} target={}", elapsed, target);
        }
    }

    #[test]
    fn stage_index_tracks_elapsed_time() {
        let profile = ramp();
        assert_eq!(profile.stage_index_at(secs(1)), Some(0));
        assert_eq!(profile.stage_index_at(secs(11)), Some(1));
        assert_eq!(profile.stage_index_at(secs(29)), Some(2));
        assert_eq!(profile.stage_index_at(secs(30)), None);
    }

    #[test]
    fn total_duration_and_max_target() {
        let profile = ramp();
        assert_eq!(profile.total_duration(), Some(secs(30)));
        assert_eq!(profile.max_target(), 200);
    }

    #[test]
    fn validate_rejects_empty_profiles() {
        assert!(LoadProfile::Fixed {
            concurrency: 0,
            iterations: 10
        }
        .validate()
        .is_err());
        assert!(LoadProfile::Staged { stages: vec![] }.validate().is_err());
        assert!(ramp().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_length_staged_profile() {
        let instant = LoadProfile::Staged {
            stages: vec![Stage::new(Duration::ZERO, 5)],
        };
        assert!(matches!(instant.validate(), Err(EngineError::Config(_))));

        let step_then_hold = LoadProfile::Staged {
            stages: vec![Stage::new(Duration::ZERO, 5), Stage::new(secs(1), 5)],
        };
        assert!(step_then_hold.validate().is_ok());
    }

    #[test]
    fn parse_stages() {
        let stages = parse_stages_string("10s:50, 10s:200,20s:600,10s:0").unwrap();
        assert_eq!(stages.len(), 4);
        assert_eq!(stages[0], Stage::new(secs(10), 50));
        assert_eq!(stages[2], Stage::new(secs(20), 600));
        assert_eq!(stages[3].target, 0);
    }

    #[test]
    fn parse_stages_rejects_bad_input() {
        assert!(parse_stages_string("").is_err());
        assert!(parse_stages_string("10s").is_err());
        assert!(parse_stages_string("10s:-5").is_err());
        assert!(parse_stages_string("ten:5").is_err());
    }
}
