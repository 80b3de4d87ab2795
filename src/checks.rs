//! Response checks.
//!
//! A check is a named predicate evaluated against every response. Checks never
//! abort a request or a run: each one yields its own pass/fail record on the
//! outcome and the aggregator counts them.
//!
//! Checks are written as short expressions:
//!
//! ```text
//! status == 200
//! status < 400
//! latency <= 250ms
//! body contains "ok"
//! body matches ^\{"status":
//! header x-request-id
//! ```

use std::fmt;
use std::time::Duration;

use regex::Regex;
use reqwest::header::HeaderMap;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::utils::parse_duration_string;

/// Errors raised while parsing a check expression.
#[derive(Error, Debug)]
pub enum CheckParseError {
    #[error("Empty check expression")]
    Empty,

    #[error("Unknown check subject in '{0}'. Expected status, latency, body, or header")]
    UnknownSubject(String),

    #[error("Missing comparison operator in '{0}'. Use one of ==, !=, <, <=, >, >=")]
    MissingOperator(String),

    #[error("Invalid status code '{value}' in '{expr}'")]
    InvalidStatus { expr: String, value: String },

    #[error("Invalid latency '{value}' in '{expr}': {reason}")]
    InvalidLatency {
        expr: String,
        value: String,
        reason: String,
    },

    #[error("Body check '{0}' must be 'body contains <text>' or 'body matches <regex>'")]
    InvalidBodyCheck(String),

    #[error("Header check '{0}' must name a header")]
    MissingHeaderName(String),

    #[error("Regex compilation failed: {0}")]
    Regex(#[from] regex::Error),
}

/// Comparison operators for numeric checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    // Two-character operators first so "<=" is not read as "<".
    const TOKENS: [(&'static str, Comparator); 6] = [
        ("==", Comparator::Eq),
        ("!=", Comparator::Ne),
        ("<=", Comparator::Le),
        (">=", Comparator::Ge),
        ("<", Comparator::Lt),
        (">", Comparator::Gt),
    ];

    fn split(rest: &str) -> Option<(Comparator, &str)> {
        let rest = rest.trim_start();
        Self::TOKENS
            .iter()
            .find_map(|(token, cmp)| rest.strip_prefix(token).map(|value| (*cmp, value.trim())))
    }

    pub fn compare<T: PartialOrd>(&self, actual: T, expected: T) -> bool {
        match self {
            Comparator::Eq => actual == expected,
            Comparator::Ne => actual != expected,
            Comparator::Lt => actual < expected,
            Comparator::Le => actual <= expected,
            Comparator::Gt => actual > expected,
            Comparator::Ge => actual >= expected,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

/// What a check inspects.
#[derive(Debug, Clone)]
pub enum CheckKind {
    Status(Comparator, u16),
    Latency(Comparator, Duration),
    BodyContains(String),
    BodyMatches(Regex),
    HeaderExists(String),
}

/// A named response predicate.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub kind: CheckKind,
}

impl Check {
    /// Parses an expression; the check is named after the expression text.
    pub fn parse(expr: &str) -> Result<Self, CheckParseError> {
        let expr = expr.trim();
        Ok(Self {
            name: expr.to_string(),
            kind: Self::parse_kind(expr)?,
        })
    }

    /// Parses an expression under an explicit name, e.g. `("status 200", "status == 200")`.
    pub fn named(name: &str, expr: &str) -> Result<Self, CheckParseError> {
        let mut check = Self::parse(expr)?;
        if !name.trim().is_empty() {
            check.name = name.trim().to_string();
        }
        Ok(check)
    }

    /// Parses `expr` or `name: expr`.
    ///
    /// The whole item is tried as an expression first, so a colon inside an
    /// expression (`body contains "a:b"`) is never taken for a label.
    pub fn parse_labeled(item: &str) -> Result<Self, CheckParseError> {
        let whole = Self::parse(item);
        if whole.is_ok() {
            return whole;
        }
        match item.split_once(':') {
            Some((name, expr)) if !name.trim().is_empty() => {
                Self::named(name, expr).or(whole)
            }
            _ => whole,
        }
    }

    fn parse_kind(expr: &str) -> Result<CheckKind, CheckParseError> {
        if expr.is_empty() {
            return Err(CheckParseError::Empty);
        }

        if let Some(rest) = expr.strip_prefix("status") {
            let (cmp, value) =
                Comparator::split(rest).ok_or_else(|| CheckParseError::MissingOperator(expr.into()))?;
            let code: u16 = value.parse().map_err(|_| CheckParseError::InvalidStatus {
                expr: expr.into(),
                value: value.into(),
            })?;
            return Ok(CheckKind::Status(cmp, code));
        }

        if let Some(rest) = expr.strip_prefix("latency") {
            let (cmp, value) =
                Comparator::split(rest).ok_or_else(|| CheckParseError::MissingOperator(expr.into()))?;
            let threshold =
                parse_duration_string(value).map_err(|reason| CheckParseError::InvalidLatency {
                    expr: expr.into(),
                    value: value.into(),
                    reason,
                })?;
            return Ok(CheckKind::Latency(cmp, threshold));
        }

        if let Some(rest) = expr.strip_prefix("body ") {
            let rest = rest.trim_start();
            if let Some(text) = rest.strip_prefix("contains ") {
                return Ok(CheckKind::BodyContains(unquote(text.trim()).to_string()));
            }
            if let Some(pattern) = rest.strip_prefix("matches ") {
                return Ok(CheckKind::BodyMatches(Regex::new(unquote(pattern.trim()))?));
            }
            return Err(CheckParseError::InvalidBodyCheck(expr.into()));
        }

        if expr == "header" {
            return Err(CheckParseError::MissingHeaderName(expr.into()));
        }
        if let Some(rest) = expr.strip_prefix("header ") {
            return Ok(CheckKind::HeaderExists(rest.trim().to_lowercase()));
        }

        Err(CheckParseError::UnknownSubject(expr.into()))
    }

    /// True when evaluating this check requires the response body.
    pub fn needs_body(&self) -> bool {
        matches!(
            self.kind,
            CheckKind::BodyContains(_) | CheckKind::BodyMatches(_)
        )
    }

    /// Evaluates the check against a received response.
    pub fn evaluate(&self, response: &ResponseView<'_>) -> CheckOutcome {
        let (passed, actual) = match &self.kind {
            CheckKind::Status(cmp, expected) => (
                cmp.compare(response.status, *expected),
                response.status.to_string(),
            ),
            CheckKind::Latency(cmp, threshold) => (
                cmp.compare(response.latency, *threshold),
                format!("{}ms", response.latency.as_millis()),
            ),
            CheckKind::BodyContains(text) => (response.body.contains(text.as_str()), preview(response.body)),
            CheckKind::BodyMatches(re) => (re.is_match(response.body), preview(response.body)),
            CheckKind::HeaderExists(name) => {
                let found = response.headers.contains_key(name.as_str());
                (found, format!("header '{}' {}", name, if found { "present" } else { "absent" }))
            }
        };

        debug!(check = %self.name, passed = passed, actual = %actual, "Check evaluated");

        CheckOutcome {
            name: self.name.clone(),
            passed,
            actual,
        }
    }
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Status(cmp, code) => write!(f, "status {} {}", cmp.symbol(), code),
            CheckKind::Latency(cmp, d) => write!(f, "latency {} {}ms", cmp.symbol(), d.as_millis()),
            CheckKind::BodyContains(text) => write!(f, "body contains '{}'", text),
            CheckKind::BodyMatches(re) => write!(f, "body matches /{}/", re.as_str()),
            CheckKind::HeaderExists(name) => write!(f, "header '{}' exists", name),
        }
    }
}

/// The parts of a response a check can look at.
pub struct ResponseView<'a> {
    pub status: u16,
    pub latency: Duration,
    pub body: &'a str,
    pub headers: &'a HeaderMap,
}

/// Result of one check against one response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    /// Observed value, for diagnostics
    pub actual: String,
}

/// Runs every check independently; one failing check never skips the others.
pub fn run_checks(checks: &[Check], response: &ResponseView<'_>) -> Vec<CheckOutcome> {
    checks.iter().map(|check| check.evaluate(response)).collect()
}

/// Parses a `;`-separated list of check expressions, as used by the `CHECKS` variable.
/// Each item is either a bare expression or `name: expr`.
pub fn parse_check_list(s: &str) -> Result<Vec<Check>, CheckParseError> {
    s.split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(Check::parse_labeled)
        .collect()
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

fn preview(body: &str) -> String {
    match body.char_indices().nth(100) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
