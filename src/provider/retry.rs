//! Retry logic for provider requests
//!
//! Exponential backoff for transient HTTP statuses, honoring `Retry-After`.
//! Retryable status codes by default:
//!
//! - 429: Too Many Requests (rate limited)
//! - 500: Internal Server Error
//! - 502: Bad Gateway
//! - 503: Service Unavailable
//! - 529: Overloaded (Anthropic-specific)
//!
//! Once retries are exhausted the final status and body are handed back as
//! [`RetryOutcome::Rejected`] so the adapter can surface them as an error
//! event. Backoff sleeps race the cancellation token.

use std::time::Duration;

use crate::error::{ConverseError, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Configuration for API retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential growth)
    pub max_delay_ms: u64,
    /// HTTP status codes that trigger a retry
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            retryable_status_codes: vec![429, 500, 502, 503, 529],
        }
    }
}

impl RetryConfig {
    /// Create a retry config with no retries (disabled)
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable_status_codes.contains(&status.as_u16())
    }

    /// Delay for a given attempt number (0-indexed).
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`, with a deterministic
    /// ±25% spread so concurrent sessions do not retry in lockstep.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp_delay = self.base_delay_ms.saturating_mul(1u64 << attempt.min(10));
        let capped = exp_delay.min(self.max_delay_ms);

        let jitter_range = capped / 4;
        let delay = if jitter_range > 0 {
            let offset = (attempt as u64 * 7 + 3) % (jitter_range * 2 + 1);
            capped - jitter_range + offset
        } else {
            capped
        };

        Duration::from_millis(delay)
    }

    /// Parse a `Retry-After` header given in (possibly fractional) seconds.
    ///
    /// Values outside (0, 300] are ignored.
    pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
        let value = header_value?.trim();
        if let Ok(seconds) = value.parse::<f64>() {
            if seconds > 0.0 && seconds <= 300.0 {
                return Some(Duration::from_secs_f64(seconds));
            }
        }
        None
    }
}

/// Outcome of a single HTTP attempt
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    /// Transient failure worth retrying
    Retryable {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    /// Non-retryable HTTP status
    Rejected { status: StatusCode, body: String },
    /// Network failure; bail immediately
    Fatal(ConverseError),
}

/// Final outcome once retries are done
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    Rejected { status: u16, body: String },
}

/// Run `operation` until it succeeds, is rejected, or retries run out.
///
/// Returns `Err(ConverseError::Cancelled)` if the token fires while waiting.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation: F,
) -> Result<RetryOutcome<T>>
where
    F: Fn(u32) -> Fut,
    Fut: std::future::Future<Output = AttemptOutcome<T>>,
{
    let mut last_status = StatusCode::INTERNAL_SERVER_ERROR;
    let mut last_body = String::new();

    for attempt in 0..=config.max_retries {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ConverseError::Cancelled),
            outcome = operation(attempt) => outcome,
        };

        match outcome {
            AttemptOutcome::Success(value) => {
                if attempt > 0 {
                    tracing::info!("Provider request succeeded after {} retries", attempt);
                }
                return Ok(RetryOutcome::Success(value));
            }
            AttemptOutcome::Rejected { status, body } => {
                return Ok(RetryOutcome::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            AttemptOutcome::Fatal(err) => return Err(err),
            AttemptOutcome::Retryable {
                status,
                body,
                retry_after,
            } => {
                last_status = status;
                last_body = body;

                if attempt < config.max_retries {
                    let delay = retry_after.unwrap_or_else(|| config.delay_for_attempt(attempt));
                    tracing::warn!(
                        "Provider request failed with {} (attempt {}/{}), retrying in {:?}",
                        status,
                        attempt + 1,
                        config.max_retries + 1,
                        delay,
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ConverseError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    tracing::warn!(
        "Provider request failed after {} attempts with {}",
        config.max_retries + 1,
        last_status
    );
    Ok(RetryOutcome::Rejected {
        status: last_status.as_u16(),
        body: last_body,
    })
}

/// Send an HTTP request built fresh for every attempt.
///
/// `build` is called per attempt so signed requests get a new timestamp.
pub async fn send_with_retry<F>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    build: F,
) -> Result<RetryOutcome<reqwest::Response>>
where
    F: Fn(u32) -> Result<reqwest::RequestBuilder>,
{
    with_retry(config, cancel, |attempt| {
        let request = build(attempt);
        async move {
            let request = match request {
                Ok(r) => r,
                Err(e) => return AttemptOutcome::Fatal(e),
            };
            match request.send().await {
                Ok(resp) if resp.status().is_success() => AttemptOutcome::Success(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = RetryConfig::parse_retry_after(
                        resp.headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok()),
                    );
                    let body = resp.text().await.unwrap_or_default();
                    if config.is_retryable_status(status) {
                        AttemptOutcome::Retryable {
                            status,
                            body,
                            retry_after,
                        }
                    } else {
                        AttemptOutcome::Rejected { status, body }
                    }
                }
                Err(e) => AttemptOutcome::Fatal(ConverseError::Transport(format!(
                    "Failed to send request: {}",
                    e
                ))),
            }
        }
    })
    .await
}
