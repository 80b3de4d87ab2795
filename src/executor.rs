//! Single request/response cycle.
//!
//! `RequestExecutor::execute` never fails: a transport error becomes a
//! `RequestOutcome` with `CheckStatus::Error`, so one bad request can not
//! abort a virtual user or the run.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::checks::{run_checks, Check, ResponseView};
use crate::errors::CategorizedError;
use crate::outcome::RequestOutcome;
use crate::target::Endpoint;

/// Issues GETs against one endpoint and evaluates the configured checks.
#[derive(Clone)]
pub struct RequestExecutor {
    client: reqwest::Client,
    endpoint: Endpoint,
    checks: Arc<[Check]>,
    needs_body: bool,
}

impl RequestExecutor {
    pub fn new(client: reqwest::Client, endpoint: Endpoint, checks: Vec<Check>) -> Self {
        let needs_body = checks.iter().any(Check::needs_body);
        Self {
            client,
            endpoint,
            checks: checks.into(),
            needs_body,
        }
    }

    /// Sends one GET and returns its outcome.
    ///
    /// Latency covers sending the request through reading the full body.
    pub async fn execute(&self, vu_id: usize, iteration: u64) -> RequestOutcome {
        let timestamp = SystemTime::now();
        let request_start = Instant::now();

        let response = match self.client.get(self.endpoint.url().clone()).send().await {
            Ok(response) => response,
            Err(e) => return self.transport_failure(vu_id, iteration, timestamp, request_start, &e),
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        let body = if self.needs_body {
            match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    return self.transport_failure(vu_id, iteration, timestamp, request_start, &e)
                }
            }
        } else {
            // Stream and discard so the connection can go back to the pool.
            let mut response = response;
            loop {
                match response.chunk().await {
                    Ok(Some(_chunk)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        return self.transport_failure(
                            vu_id,
                            iteration,
                            timestamp,
                            request_start,
                            &e,
                        )
                    }
                }
            }
            String::new()
        };

        let latency = request_start.elapsed();
        let checks = run_checks(
            &self.checks,
            &ResponseView {
                status,
                latency,
                body: &body,
                headers: &headers,
            },
        );

        debug!(
            vu_id = vu_id,
            iteration = iteration,
            status_code = status,
            latency_ms = latency.as_millis() as u64,
            "Request completed"
        );

        RequestOutcome::completed(vu_id, iteration, timestamp, latency, status, checks)
    }

    fn transport_failure(
        &self,
        vu_id: usize,
        iteration: u64,
        timestamp: SystemTime,
        request_start: Instant,
        error: &reqwest::Error,
    ) -> RequestOutcome {
        let latency = request_start.elapsed();
        let categorized = CategorizedError::from_reqwest(error);

        warn!(
            vu_id = vu_id,
            iteration = iteration,
            url = %self.endpoint,
            error = %error,
            error_category = %categorized.category.label(),
            "Request failed"
        );

        RequestOutcome::failed(vu_id, iteration, timestamp, latency, categorized)
    }
}
