//! Target endpoint resolution.
//!
//! The endpoint comes from an explicit override (the plan file's `target`)
//! and falls back to an environment variable, `TARGET` by default.

use std::env;
use std::fmt;

use reqwest::Url;
use tracing::debug;

use crate::errors::EngineError;

/// Environment variable consulted when no override is given.
pub const DEFAULT_TARGET_ENV_VAR: &str = "TARGET";

/// A validated absolute http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Parses and validates an endpoint string.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let raw = raw.trim();
        let url = Url::parse(raw)
            .map_err(|e| EngineError::Config(format!("Invalid target URL '{}': {}", raw, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(EngineError::Config(format!(
                    "Target URL must use http or https, got scheme '{}' in '{}'",
                    other, raw
                )))
            }
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(EngineError::Config(format!(
                "Target URL '{}' has no host",
                raw
            )));
        }

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Resolves the endpoint from an override, falling back to `env_var`.
pub fn resolve_target(override_value: Option<&str>, env_var: &str) -> Result<Endpoint, EngineError> {
    let env_value = env::var(env_var).ok();
    let present = |v: Option<&str>| v.is_some_and(|v| !v.trim().is_empty());

    if !present(override_value) && !present(env_value.as_deref()) {
        return Err(EngineError::Config(format!(
            "No target configured: set the '{}' environment variable or provide `target` in the plan file",
            env_var
        )));
    }

    resolve_target_from(override_value, env_value.as_deref())
}

/// Pure resolution: the override wins when present and non-blank.
pub fn resolve_target_from(
    override_value: Option<&str>,
    env_value: Option<&str>,
) -> Result<Endpoint, EngineError> {
    let non_blank = |v: &&str| !v.trim().is_empty();

    let (raw, source) = match (override_value.filter(non_blank), env_value.filter(non_blank)) {
        (Some(raw), _) => (raw, "override"),
        (None, Some(raw)) => (raw, "environment"),
        (None, None) => return Err(EngineError::Config("No target configured".to_string())),
    };

    let endpoint = Endpoint::parse(raw)?;
    debug!(target_url = %endpoint, source = source, "Resolved target endpoint");
    Ok(endpoint)
}
