//! Retry policy for outbound guest requests.
//!
//! Transient outcomes are retried a bounded number of times:
//! - HTTP 429, waiting `Retry-After` seconds when the server sends them,
//! - connect, timeout and request-level transport errors.
//!
//! Everything else (any other status, builder errors) is returned at once.
//! The whole sequence, sleeps included, is capped by an overall timeout.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::backoff::Backoff;
use super::{origin, FetchError};
use crate::config::ResilienceConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: ResilienceConfig,
}

impl RetryPolicy {
    pub fn new(config: ResilienceConfig) -> Self {
        Self { config }
    }

    /// Runs `send` until it yields a non-transient outcome or retries run
    /// out. `send` is called once per attempt and must build a fresh request.
    ///
    /// When retries on 429 are exhausted the last 429 response is returned
    /// as-is; exhausted transport errors become `FetchError::Transport`.
    pub async fn execute<F, Fut>(&self, send: F) -> Result<reqwest::Response, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let ceiling = self.config.overall_timeout();
        match tokio::time::timeout(ceiling, self.attempts(send)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Outbound request exceeded overall timeout of {}s", ceiling.as_secs());
                Err(FetchError::Timeout(ceiling))
            }
        }
    }

    async fn attempts<F, Fut>(&self, mut send: F) -> Result<reqwest::Response, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut backoff = Backoff::from_config(&self.config);

        loop {
            let outcome = send().await;
            let can_retry = !backoff.exceeded_max_attempts(self.config.max_retries);

            let delay = match outcome {
                Ok(response) if response.status() == StatusCode::TOO_MANY_REQUESTS && can_retry => {
                    let hint = retry_after(response.headers());
                    let delay = backoff.next_delay(hint);
                    warn!(
                        "HTTP 429 from {}, retry {}/{} in {}ms",
                        origin(response.url()),
                        backoff.attempt,
                        self.config.max_retries,
                        delay.as_millis()
                    );
                    delay
                }
                Ok(response) => return Ok(response),
                Err(e) if is_transient(&e) && can_retry => {
                    let delay = backoff.next_delay(None);
                    warn!(
                        "Transport error ({}), retry {}/{} in {}ms",
                        loggable(&e),
                        backoff.attempt,
                        self.config.max_retries,
                        delay.as_millis()
                    );
                    delay
                }
                Err(e) => {
                    debug!("Outbound request failed without retry: {}", loggable(&e));
                    return Err(FetchError::Transport(error_chain(&e)));
                }
            };

            tokio::time::sleep(delay).await;
        }
    }
}

/// `Retry-After` as a whole number of seconds. HTTP-date values are not
/// honored and fall back to the default schedule.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn is_transient(e: &reqwest::Error) -> bool {
    !e.is_builder() && (e.is_connect() || e.is_timeout() || e.is_request())
}

/// [`error_chain`] with the request URL cut down to its origin.
fn loggable(e: &reqwest::Error) -> String {
    let text = error_chain(e);
    match e.url() {
        Some(url) => text.replace(url.as_str(), &origin(url)),
        None => text,
    }
}

/// Flattens an error and its sources into one line. reqwest's own
/// `Display` hides the underlying cause (e.g. "connection refused").
pub(crate) fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
