use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::checks::CheckOutcome;
use crate::errors::{CategorizedError, ErrorCategory};

/// Overall verdict of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// A response arrived and every check passed.
    Pass,
    /// A response arrived but at least one check failed.
    Fail,
    /// No response: connection failure, timeout, TLS error.
    Error,
}

/// The record of one request/response cycle.
///
/// Produced by the executor, moved into the aggregator, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub vu_id: usize,
    /// Per-VU iteration number, starting at 0
    pub iteration: u64,
    pub timestamp: SystemTime,
    pub latency: Duration,
    pub status_code: Option<u16>,
    pub checks: Vec<CheckOutcome>,
    pub check_result: CheckStatus,
    pub error: Option<CategorizedError>,
}

impl RequestOutcome {
    /// Builds the outcome of a request that received a response.
    pub fn completed(
        vu_id: usize,
        iteration: u64,
        timestamp: SystemTime,
        latency: Duration,
        status_code: u16,
        checks: Vec<CheckOutcome>,
    ) -> Self {
        let check_result = if checks.iter().all(|c| c.passed) {
            CheckStatus::Pass
        } else {
            CheckStatus::Fail
        };

        Self {
            vu_id,
            iteration,
            timestamp,
            latency,
            status_code: Some(status_code),
            checks,
            check_result,
            error: None,
        }
    }

    /// Builds the outcome of a request that never got a response.
    pub fn failed(
        vu_id: usize,
        iteration: u64,
        timestamp: SystemTime,
        latency: Duration,
        error: CategorizedError,
    ) -> Self {
        Self {
            vu_id,
            iteration,
            timestamp,
            latency,
            status_code: None,
            checks: Vec::new(),
            check_result: CheckStatus::Error,
            error: Some(error),
        }
    }

    /// Counted as a failure in the summary: a network error or a failed check.
    pub fn is_failure(&self) -> bool {
        self.check_result != CheckStatus::Pass
    }

    /// The error category of the HTTP status, if it is 4xx/5xx.
    pub fn status_category(&self) -> Option<ErrorCategory> {
        self.status_code.and_then(ErrorCategory::from_status_code)
    }
}
