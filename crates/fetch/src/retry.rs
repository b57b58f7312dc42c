//! Attempt loop with per-attempt deadlines and exponential backoff.

use std::time::Duration;

use {
    reqwest::{Client, Method},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    error::FetchError,
    options::{FetchResponse, RequestBody, build_form},
};

/// Delay before the first retry; doubles on each further retry.
pub const BASE_BACKOFF: Duration = Duration::from_millis(100);

/// Delay slept after failed attempt number `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    BASE_BACKOFF.saturating_mul(1 << exp)
}

/// Everything needed to run a request's attempts, owned so it can move into
/// a spawned task.
pub(crate) struct AttemptPlan {
    pub client: Client,
    /// As given by the caller; used in errors and logs.
    pub url: String,
    /// Absolute URL actually requested.
    pub target: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub timeout: Duration,
    pub retries: u32,
    pub shutdown: CancellationToken,
}

impl AttemptPlan {
    pub(crate) async fn run(self) -> Result<FetchResponse, FetchError> {
        let total = self.retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            let err = match self.attempt_once().await {
                Ok(response) => {
                    if attempt > 1 {
                        debug!(url = %self.url, attempt, "request succeeded after retry");
                    }
                    return Ok(response);
                },
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!(url = %self.url, attempt, error = %err, "non-retryable failure");
                return Err(err);
            }
            if attempt >= total || self.shutdown.is_cancelled() {
                warn!(url = %self.url, attempts = attempt, error = %err, "request failed, giving up");
                return Err(self.exhausted(attempt, err));
            }

            let delay = backoff_delay(attempt);
            debug!(
                url = %self.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying request"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = self.shutdown.cancelled() => {
                    return Err(self.exhausted(attempt, FetchError::Aborted));
                },
            }
            attempt += 1;
        }
    }

    fn exhausted(&self, attempts: u32, last: FetchError) -> FetchError {
        FetchError::Exhausted {
            url: self.url.clone(),
            attempts,
            source: Box::new(last),
        }
    }

    /// One attempt with its own cancellation token and full deadline.
    async fn attempt_once(&self) -> Result<FetchResponse, FetchError> {
        let token = self.shutdown.child_token();
        let request = self.build_request()?;

        let call = async {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    status_text: status.canonical_reason().unwrap_or_default().to_string(),
                });
            }
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, FetchError>(FetchResponse {
                status,
                headers,
                body,
            })
        };

        tokio::select! {
            result = call => result,
            () = tokio::time::sleep(self.timeout) => {
                token.cancel();
                Err(FetchError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            },
            () = token.cancelled() => Err(FetchError::Aborted),
        }
    }

    fn build_request(&self) -> Result<reqwest::RequestBuilder, FetchError> {
        let mut request = self.client.request(self.method.clone(), &self.target);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request = match &self.body {
            None => request,
            Some(RequestBody::Text(text)) => request.body(text.clone()),
            Some(RequestBody::Multipart(fields)) => request.multipart(build_form(fields)?),
        };
        Ok(request)
    }
}
