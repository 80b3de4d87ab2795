//! Error taxonomy for the load engine.
//!
//! Two layers live here:
//! - [`EngineError`]: errors that stop a run (bad configuration, broken
//!   internal invariants) or that the scheduler logs and degrades on
//!   (resource exhaustion).
//! - [`ErrorCategory`] / [`CategorizedError`]: per-request failures. These are
//!   never propagated; they are recorded on the outcome and counted.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the engine itself.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid or missing target, profile, or option. Fatal before any VU starts.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A virtual user could not be admitted. The scheduler logs this and keeps going.
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    /// An internal invariant was broken (e.g. more iterations recorded than budgeted).
    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl EngineError {
    /// Process exit code for this error when it terminates the run.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) | EngineError::Client(_) => 1,
            EngineError::ResourceExhaustion(_) | EngineError::Internal(_) => 3,
        }
    }
}

/// Categories of per-request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// HTTP 4xx responses
    ClientError,

    /// HTTP 5xx responses
    ServerError,

    /// DNS, refused connections, broken bodies
    NetworkError,

    TimeoutError,

    TlsError,

    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code. Returns None for 2xx/3xx.
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a transport-level reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return ErrorCategory::TimeoutError;
        }
        if error.is_connect() || error.is_request() || error.is_body() || error.is_decode() {
            // TLS handshake failures surface as connect errors; look at the chain.
            if Self::message_mentions_tls(error) {
                return ErrorCategory::TlsError;
            }
            return ErrorCategory::NetworkError;
        }
        if error.is_redirect() {
            return ErrorCategory::ClientError;
        }

        let msg = error.to_string().to_lowercase();
        if msg.contains("timeout") {
            ErrorCategory::TimeoutError
        } else if Self::message_mentions_tls(error) {
            ErrorCategory::TlsError
        } else if msg.contains("dns") || msg.contains("connection") {
            ErrorCategory::NetworkError
        } else {
            ErrorCategory::OtherError
        }
    }

    fn message_mentions_tls(error: &reqwest::Error) -> bool {
        let mut source: Option<&dyn std::error::Error> = Some(error);
        while let Some(err) = source {
            let msg = err.to_string().to_lowercase();
            if msg.contains("certificate") || msg.contains("tls") || msg.contains("ssl") {
                return true;
            }
            source = err.source();
        }
        false
    }

    /// Stable label used in logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::TlsError => "tls_error",
            ErrorCategory::OtherError => "other_error",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "HTTP 4xx Client Errors",
            ErrorCategory::ServerError => "HTTP 5xx Server Errors",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Request Timeout Errors",
            ErrorCategory::TlsError => "TLS/SSL Certificate Errors",
            ErrorCategory::OtherError => "Other/Unknown Errors",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A per-request failure with its category, attached to a `RequestOutcome`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub message: String,
}

impl CategorizedError {
    /// Build from a transport error returned by reqwest.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        Self {
            category: ErrorCategory::from_reqwest_error(error),
            message: error.to_string(),
        }
    }

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category.label(), self.message)
    }
}
