use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::checks::{parse_check_list, Check};
use crate::client::ClientConfig;
use crate::errors::EngineError;
use crate::load_models::{parse_stages_string, LoadProfile, Stage};
use crate::scheduler::SchedulerConfig;
use crate::target::{resolve_target, Endpoint, DEFAULT_TARGET_ENV_VAR};
use crate::utils::{parse_bool_flag, parse_duration_string};
use crate::vu::Pacing;
use crate::yaml_config::YamlConfig;

/// How the final summary is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SummaryFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for SummaryFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(SummaryFormat::Text),
            "json" => Ok(SummaryFormat::Json),
            other => Err(EngineError::Config(format!(
                "Unknown summary format '{}', expected 'text' or 'json'",
                other
            ))),
        }
    }
}

impl fmt::Display for SummaryFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryFormat::Text => f.write_str("text"),
            SummaryFormat::Json => f.write_str("json"),
        }
    }
}

/// Main configuration for a run.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Endpoint,
    pub profile: LoadProfile,
    pub pacing: Pacing,
    pub checks: Vec<Check>,
    /// Maximum tolerated failure rate (0.0 to 1.0).
    pub failure_threshold: Option<f64>,
    pub run_timeout: Option<Duration>,
    pub client: ClientConfig,
    pub scheduler: SchedulerConfig,
    pub summary_interval: Option<Duration>,
    pub summary_format: SummaryFormat,
    pub print_metrics: bool,
}

/// One layer of optional settings. Environment variables form the upper
/// layer, a YAML plan the lower one.
#[derive(Debug, Default)]
struct Settings {
    target: Option<String>,
    vus: Option<usize>,
    iterations: Option<u64>,
    stages: Option<Vec<Stage>>,
    pacing: Option<Pacing>,
    checks: Option<Vec<Check>>,
    failure_threshold: Option<f64>,
    run_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    max_vus: Option<usize>,
    tick_interval: Option<Duration>,
    summary_interval: Option<Duration>,
    summary_format: Option<SummaryFormat>,
    skip_tls_verify: Option<bool>,
    custom_headers: Option<String>,
    resolve_target_addr: Option<String>,
    print_metrics: Option<bool>,
}

impl Settings {
    fn from_env() -> Result<Self, EngineError> {
        Ok(Self {
            // TARGET is read by the resolver as the fallback, never as the override.
            target: None,
            vus: env_parse("VUS")?,
            iterations: env_parse("ITERATIONS")?,
            stages: env_string("STAGES")
                .map(|s| parse_stages_string(&s))
                .transpose()?,
            pacing: env_string("PACING").map(|s| Pacing::parse(&s)).transpose()?,
            checks: env_string("CHECKS")
                .map(|s| {
                    parse_check_list(&s)
                        .map_err(|e| EngineError::Config(format!("Invalid CHECKS: {}", e)))
                })
                .transpose()?,
            failure_threshold: env_parse("FAILURE_THRESHOLD")?,
            run_timeout: env_duration("RUN_TIMEOUT")?,
            request_timeout: env_duration("REQUEST_TIMEOUT")?,
            max_vus: env_parse("MAX_VUS")?,
            tick_interval: env_duration("TICK_INTERVAL")?,
            summary_interval: env_duration("SUMMARY_INTERVAL")?,
            summary_format: env_string("SUMMARY_FORMAT")
                .map(|s| s.parse())
                .transpose()?,
            skip_tls_verify: env_string("SKIP_TLS_VERIFY").map(|s| parse_bool_flag(&s)),
            custom_headers: env_string("CUSTOM_HEADERS"),
            resolve_target_addr: env_string("RESOLVE_TARGET_ADDR"),
            print_metrics: env_string("PRINT_METRICS").map(|s| parse_bool_flag(&s)),
        })
    }

    fn from_yaml(yaml: &YamlConfig) -> Result<Self, EngineError> {
        let yaml_err = |e: crate::yaml_config::YamlConfigError| EngineError::Config(e.to_string());
        let duration = |d: &Option<crate::yaml_config::YamlDuration>| {
            d.as_ref()
                .map(|d| d.to_std_duration().map_err(yaml_err))
                .transpose()
        };

        Ok(Self {
            target: yaml.target.clone(),
            vus: yaml.vus,
            iterations: yaml.iterations,
            stages: yaml.to_stages().map_err(yaml_err)?,
            pacing: yaml
                .pacing
                .as_ref()
                .map(|p| p.to_pacing().map_err(yaml_err))
                .transpose()?,
            checks: if yaml.checks.is_empty() {
                None
            } else {
                Some(yaml.to_checks().map_err(yaml_err)?)
            },
            failure_threshold: yaml.thresholds.failure_rate,
            run_timeout: duration(&yaml.run_timeout)?,
            request_timeout: duration(&yaml.http.request_timeout)?,
            max_vus: yaml.max_vus,
            tick_interval: duration(&yaml.tick_interval)?,
            summary_interval: duration(&yaml.summary.interval)?,
            summary_format: yaml
                .summary
                .format
                .as_deref()
                .map(str::parse)
                .transpose()?,
            skip_tls_verify: yaml.http.skip_tls_verify,
            custom_headers: yaml.http.custom_headers.clone(),
            resolve_target_addr: yaml.http.resolve_target_addr.clone(),
            print_metrics: None,
        })
    }

    /// Fills unset fields from `lower`.
    ///
    /// The load profile is taken as a unit: if this layer names any of
    /// `vus`, `iterations` or `stages`, the lower layer's profile is ignored.
    fn over(self, lower: Settings) -> Settings {
        let upper_has_profile =
            self.vus.is_some() || self.iterations.is_some() || self.stages.is_some();
        let (vus, iterations, stages) = if upper_has_profile {
            (self.vus, self.iterations, self.stages)
        } else {
            (lower.vus, lower.iterations, lower.stages)
        };

        Settings {
            target: self.target.or(lower.target),
            vus,
            iterations,
            stages,
            pacing: self.pacing.or(lower.pacing),
            checks: self.checks.or(lower.checks),
            failure_threshold: self.failure_threshold.or(lower.failure_threshold),
            run_timeout: self.run_timeout.or(lower.run_timeout),
            request_timeout: self.request_timeout.or(lower.request_timeout),
            max_vus: self.max_vus.or(lower.max_vus),
            tick_interval: self.tick_interval.or(lower.tick_interval),
            summary_interval: self.summary_interval.or(lower.summary_interval),
            summary_format: self.summary_format.or(lower.summary_format),
            skip_tls_verify: self.skip_tls_verify.or(lower.skip_tls_verify),
            custom_headers: self.custom_headers.or(lower.custom_headers),
            resolve_target_addr: self.resolve_target_addr.or(lower.resolve_target_addr),
            print_metrics: self.print_metrics.or(lower.print_metrics),
        }
    }

    fn load_profile(&self) -> Result<LoadProfile, EngineError> {
        let profile = match (&self.stages, self.vus, self.iterations) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(EngineError::Config(
                    "STAGES cannot be combined with VUS/ITERATIONS: choose fixed or staged mode"
                        .to_string(),
                ))
            }
            (Some(stages), None, None) => LoadProfile::Staged {
                stages: stages.clone(),
            },
            (None, vus, iterations) => LoadProfile::Fixed {
                concurrency: vus.unwrap_or(1),
                iterations: iterations.unwrap_or(1),
            },
        };
        profile.validate()?;
        Ok(profile)
    }

    fn into_config(self) -> Result<Config, EngineError> {
        let profile = self.load_profile()?;
        let endpoint = resolve_target(self.target.as_deref(), DEFAULT_TARGET_ENV_VAR)?;

        if let Some(threshold) = self.failure_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(EngineError::Config(format!(
                    "Failure threshold {} is out of range (0.0 to 1.0)",
                    threshold
                )));
            }
        }
        if self.max_vus == Some(0) {
            return Err(EngineError::Config(
                "MAX_VUS must be greater than 0".to_string(),
            ));
        }
        let tick_interval = self
            .tick_interval
            .unwrap_or(SchedulerConfig::default().tick_interval);
        if tick_interval.is_zero() {
            return Err(EngineError::Config(
                "TICK_INTERVAL must be greater than 0".to_string(),
            ));
        }
        if self.summary_interval.is_some_and(|d| d.is_zero()) {
            return Err(EngineError::Config(
                "SUMMARY_INTERVAL must be greater than 0".to_string(),
            ));
        }

        let client_defaults = ClientConfig::default();

        Ok(Config {
            endpoint,
            profile,
            pacing: self.pacing.unwrap_or_default(),
            checks: self.checks.unwrap_or_default(),
            failure_threshold: self.failure_threshold,
            run_timeout: self.run_timeout,
            client: ClientConfig {
                request_timeout: self
                    .request_timeout
                    .unwrap_or(client_defaults.request_timeout),
                skip_tls_verify: self.skip_tls_verify.unwrap_or(false),
                resolve_target_addr: self.resolve_target_addr,
                custom_headers: self.custom_headers,
            },
            scheduler: SchedulerConfig {
                tick_interval,
                max_vus: self.max_vus,
            },
            summary_interval: self.summary_interval,
            summary_format: self.summary_format.unwrap_or_default(),
            print_metrics: self.print_metrics.unwrap_or(false),
        })
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, EngineError> {
        Settings::from_env()?.into_config()
    }

    /// Loads configuration from a YAML plan; environment variables that are
    /// set take precedence, except `TARGET`, which only fills in when the plan
    /// has no `target`.
    pub fn from_yaml_with_env_overrides(yaml: &YamlConfig) -> Result<Self, EngineError> {
        let env = Settings::from_env()?;
        let plan = Settings::from_yaml(yaml)?;
        env.over(plan).into_config()
    }

    /// Loads from the plan named by `CONFIG_FILE` if set, otherwise from the
    /// environment alone.
    pub fn load() -> Result<Self, EngineError> {
        match env_string("CONFIG_FILE") {
            Some(path) => {
                info!(config_file = %path, "Loading test plan");
                let yaml = YamlConfig::from_file(&path).map_err(|e| {
                    EngineError::Config(format!("Failed to load plan '{}': {}", path, e))
                })?;
                Self::from_yaml_with_env_overrides(&yaml)
            }
            None => Self::from_env(),
        }
    }

    /// Logs the effective configuration before the run starts.
    pub fn print_summary(&self, parsed_headers: &reqwest::header::HeaderMap) {
        match &self.profile {
            LoadProfile::Fixed {
                concurrency,
                iterations,
            } => info!(
                target_url = %self.endpoint,
                mode = "fixed",
                vus = concurrency,
                iterations = iterations,
                "Run configuration"
            ),
            LoadProfile::Staged { stages } => info!(
                target_url = %self.endpoint,
                mode = "staged",
                stages = stages.len(),
                total_secs = self.profile.total_duration().unwrap_or_default().as_secs_f64(),
                max_vus = self.profile.max_target(),
                "Run configuration"
            ),
        }

        info!(
            pacing = ?self.pacing,
            checks = self.checks.len(),
            failure_threshold = ?self.failure_threshold,
            run_timeout = ?self.run_timeout,
            request_timeout = ?self.client.request_timeout,
            admission_limit = ?self.scheduler.max_vus,
            tick_interval = ?self.scheduler.tick_interval,
            skip_tls_verify = self.client.skip_tls_verify,
            custom_headers = parsed_headers.len(),
            "Run options"
        );
    }
}

/// Help text shown when configuration fails to load.
pub fn usage() -> &'static str {
    "\
Configuration is read from environment variables, optionally layered over a
YAML plan named by CONFIG_FILE.

  TARGET               endpoint URL (fallback when the plan has no target)
  VUS, ITERATIONS      fixed mode: concurrency and shared iteration budget
  STAGES               staged mode, e.g. 10s:50,10s:200,10s:0
  PACING               delay between iterations: 100ms, 0.1s or 50ms-200ms
  CHECKS               ';'-separated checks, e.g. status == 200;latency < 500ms
  FAILURE_THRESHOLD    maximum failure rate before exiting with code 2
  RUN_TIMEOUT          stop the whole run after this long
  REQUEST_TIMEOUT      per-request timeout (default 30s)
  MAX_VUS              admission limit for virtual users
  TICK_INTERVAL        staged control loop interval (default 100ms)
  SUMMARY_INTERVAL     log progress this often
  SUMMARY_FORMAT       text or json
  PRINT_METRICS        dump Prometheus metrics at exit
  SKIP_TLS_VERIFY, CUSTOM_HEADERS, RESOLVE_TARGET_ADDR
  RUST_LOG, LOG_FORMAT=json"
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>, EngineError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env_string(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                EngineError::Config(format!("Invalid value '{}' for {}: {}", raw, name, e))
            })
        })
        .transpose()
}

fn env_duration(name: &str) -> Result<Option<Duration>, EngineError> {
    env_string(name)
        .map(|raw| {
            parse_duration_string(&raw).map_err(|e| {
                EngineError::Config(format!("Invalid duration '{}' for {}: {}", raw, name, e))
            })
        })
        .transpose()
}
