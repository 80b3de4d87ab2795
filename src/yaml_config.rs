//! YAML test plan support.
//!
//! A plan file carries the same settings as the environment variables, in a
//! version-controllable form:
//!
//! ```yaml
//! version: "1.0"
//! target: "http://my-alb.example.com"
//! vus: 800
//! iterations: 10000
//! checks:
//!   - name: "status 200"
//!     check: "status == 200"
//! ```
//!
//! Unknown fields are rejected, and so is mixing `vus`/`iterations` with
//! `stages`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::checks::Check;
use crate::load_models::Stage;
use crate::vu::Pacing;

/// Plan schema versions this build understands.
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0"];

/// Errors that can occur when loading or parsing a YAML plan.
#[derive(Error, Debug)]
pub enum YamlConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Duration format for YAML: a bare number of seconds or a string like "10s".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlDuration {
    Seconds(f64),
    String(String),
}

impl YamlDuration {
    pub fn to_std_duration(&self) -> Result<Duration, YamlConfigError> {
        match self {
            YamlDuration::Seconds(s) => Duration::try_from_secs_f64(*s).map_err(|_| {
                YamlConfigError::Validation(format!(
                    "Invalid duration {}: must be a non-negative number of seconds",
                    s
                ))
            }),
            YamlDuration::String(s) => crate::utils::parse_duration_string(s).map_err(|e| {
                YamlConfigError::Validation(format!("Invalid duration '{}': {}", s, e))
            }),
        }
    }
}

/// One ramp stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlStage {
    pub duration: YamlDuration,
    pub target: usize,
}

/// Pacing: a fixed delay, or a `{min, max}` range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlPacing {
    Fixed(YamlDuration),
    Random { min: YamlDuration, max: YamlDuration },
}

impl YamlPacing {
    pub fn to_pacing(&self) -> Result<Pacing, YamlConfigError> {
        match self {
            YamlPacing::Fixed(delay) => {
                let delay = delay.to_std_duration()?;
                Ok(if delay.is_zero() {
                    Pacing::None
                } else {
                    Pacing::Fixed(delay)
                })
            }
            YamlPacing::Random { min, max } => {
                let min = min.to_std_duration()?;
                let max = max.to_std_duration()?;
                if min > max {
                    return Err(YamlConfigError::Validation(
                        "pacing.min must not exceed pacing.max".to_string(),
                    ));
                }
                Ok(Pacing::Random { min, max })
            }
        }
    }
}

/// A check: a bare expression or a named one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum YamlCheck {
    Expression(String),
    Named { name: String, check: String },
}

impl YamlCheck {
    pub fn to_check(&self) -> Result<Check, YamlConfigError> {
        let parsed = match self {
            YamlCheck::Expression(expr) => Check::parse_labeled(expr),
            YamlCheck::Named { name, check } => Check::named(name, check),
        };
        parsed.map_err(|e| YamlConfigError::Validation(format!("Invalid check: {}", e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlThresholds {
    /// Maximum tolerated failure rate, 0.0 to 1.0
    #[serde(rename = "failureRate")]
    pub failure_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlHttpConfig {
    #[serde(rename = "requestTimeout")]
    pub request_timeout: Option<YamlDuration>,

    #[serde(rename = "skipTlsVerify")]
    pub skip_tls_verify: Option<bool>,

    #[serde(rename = "customHeaders")]
    pub custom_headers: Option<String>,

    #[serde(rename = "resolveTargetAddr")]
    pub resolve_target_addr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlSummaryConfig {
    /// "text" or "json"
    pub format: Option<String>,

    /// Log a progress summary this often
    pub interval: Option<YamlDuration>,
}

/// Root of a plan file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YamlConfig {
    #[serde(default = "default_version")]
    pub version: String,

    /// Endpoint override; the TARGET environment variable is the fallback.
    pub target: Option<String>,

    pub vus: Option<usize>,

    pub iterations: Option<u64>,

    pub stages: Option<Vec<YamlStage>>,

    pub pacing: Option<YamlPacing>,

    #[serde(default)]
    pub checks: Vec<YamlCheck>,

    #[serde(default)]
    pub thresholds: YamlThresholds,

    #[serde(rename = "runTimeout")]
    pub run_timeout: Option<YamlDuration>,

    #[serde(rename = "maxVus")]
    pub max_vus: Option<usize>,

    #[serde(rename = "tickInterval")]
    pub tick_interval: Option<YamlDuration>,

    #[serde(default)]
    pub http: YamlHttpConfig,

    #[serde(default)]
    pub summary: YamlSummaryConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl YamlConfig {
    /// Load a plan from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, YamlConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a plan from a YAML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, YamlConfigError> {
        let config: YamlConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Collects every problem instead of stopping at the first one.
    fn validate(&self) -> Result<(), YamlConfigError> {
        let mut errors = Vec::new();

        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            errors.push(format!(
                "version: unsupported version '{}', expected one of {:?}",
                self.version, SUPPORTED_VERSIONS
            ));
        }

        if self.stages.is_some() && (self.vus.is_some() || self.iterations.is_some()) {
            errors.push(
                "stages: cannot be combined with vus/iterations (choose fixed or staged mode)"
                    .to_string(),
            );
        }

        if let Some(stages) = &self.stages {
            if stages.is_empty() {
                errors.push("stages: at least one stage is required".to_string());
            }
            for (idx, stage) in stages.iter().enumerate() {
                if let Err(e) = stage.duration.to_std_duration() {
                    errors.push(format!("stages[{}].duration: {}", idx, e));
                }
            }
        }

        if self.vus == Some(0) {
            errors.push("vus: must be greater than 0".to_string());
        }

        if let Some(rate) = self.thresholds.failure_rate {
            if !(0.0..=1.0).contains(&rate) {
                errors.push(format!(
                    "thresholds.failureRate: {} is out of range (0.0 to 1.0)",
                    rate
                ));
            }
        }

        for (idx, check) in self.checks.iter().enumerate() {
            if let Err(e) = check.to_check() {
                errors.push(format!("checks[{}]: {}", idx, e));
            }
        }

        if let Some(format) = &self.summary.format {
            if !matches!(format.to_lowercase().as_str(), "text" | "json") {
                errors.push(format!(
                    "summary.format: '{}' is not one of text, json",
                    format
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(YamlConfigError::Validation(errors.join("; ")))
        }
    }

    /// Stages converted to the engine's representation.
    pub fn to_stages(&self) -> Result<Option<Vec<Stage>>, YamlConfigError> {
        self.stages
            .as_ref()
            .map(|stages| {
                stages
                    .iter()
                    .map(|s| Ok(Stage::new(s.duration.to_std_duration()?, s.target)))
                    .collect()
            })
            .transpose()
    }

    pub fn to_checks(&self) -> Result<Vec<Check>, YamlConfigError> {
        self.checks.iter().map(YamlCheck::to_check).collect()
    }
}
