//! Retry with exponential backoff for outbound HTTP calls.
//!
//! Every network boundary in the crate (message source, embedding,
//! generation and NLI providers) funnels requests through [`send_with_retry`]:
//!
//! - HTTP 429 and 5xx: retry
//! - Other 4xx: fail immediately
//! - Network errors: retry
//! - Backoff: 1s, 2s, 4s, ... capped at [`RetryPolicy::max_delay`]
//!
//! Retries never happen inside the retrieval or generation core.

use anyhow::{anyhow, bail, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Provider calls: up to 32s between attempts.
    pub fn provider(max_retries: u32) -> Self {
        Self {
            max_retries,
            max_delay: Duration::from_secs(32),
        }
    }

    /// Upstream message fetches: up to 10s between attempts.
    pub fn upstream(max_retries: u32) -> Self {
        Self {
            max_retries,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_secs(1u64 << exp).min(self.max_delay)
    }
}

pub fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(concat!("message-qa/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Send the request produced by `build`, retrying transient failures.
///
/// Returns the response for any 2xx or 3xx status (callers handle
/// `304 Not Modified` themselves).
pub async fn send_with_retry<F>(label: &str, policy: RetryPolicy, build: F) -> Result<Response>
where
    F: Fn() -> RequestBuilder,
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay(attempt);
            if let Some(err) = &last_err {
                tracing::warn!(
                    label,
                    attempt,
                    wait_seconds = delay.as_secs(),
                    error = %err,
                    "http.retry"
                );
            }
            tokio::time::sleep(delay).await;
        }

        match build().send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() || status.is_redirection() {
                    return Ok(response);
                }

                let body_text = response.text().await.unwrap_or_default();
                if is_retryable(status) {
                    last_err = Some(anyhow!("{} error {}: {}", label, status, body_text));
                    continue;
                }

                tracing::error!(label, %status, "http.request_failed");
                bail!("{} error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow!("{} connection error: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} failed after retries", label)))
}
