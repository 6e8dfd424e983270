//! HTTP GET with bounded retry and backoff.
//!
//! Used for idempotent metadata requests (search mirrors). The stream relay
//! never retries: a relayed byte stream is not restartable mid-flight.

use reqwest::{RequestBuilder, Response};
use std::time::Duration;
use tracing::warn;

/// Default number of attempts (1 initial + 1 retry).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Default pause between attempts in milliseconds.
pub const DEFAULT_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts; 0 is treated as 1.
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Per-attempt timeout; `None` defers to the client's own.
    pub timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: None,
        }
    }
}

/// Send the request produced by `build` until it returns 2xx or attempts run out.
///
/// `build` is called once per attempt because a [`RequestBuilder`] is consumed
/// by `send`. Client errors (4xx) are not retried since repeating them cannot
/// change the answer.
///
/// # Errors
///
/// The last transport error, or the last non-2xx status as a
/// [`reqwest::Error`] from `error_for_status`.
pub async fn send_with_retry<F>(build: F, config: &RetryConfig) -> Result<Response, reqwest::Error>
where
    F: Fn() -> RequestBuilder,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let mut request = build();
        if let Some(timeout) = config.timeout {
            request = request.timeout(timeout);
        }

        let outcome = request.send().await.and_then(Response::error_for_status);
        let retryable = match &outcome {
            Ok(_) => false,
            Err(e) => !e.status().is_some_and(|s| s.is_client_error()),
        };

        if !retryable || attempt >= max_attempts {
            return outcome;
        }

        if let Err(e) = &outcome {
            warn!(
                "HTTP request failed (attempt {}/{}): {}; retrying in {}ms",
                attempt,
                max_attempts,
                e,
                config.backoff.as_millis()
            );
        }
        tokio::time::sleep(config.backoff).await;
        attempt += 1;
    }
}
