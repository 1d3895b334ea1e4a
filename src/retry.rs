//! Bounded rate-limit backoff for providers that answer HTTP 429.
//!
//! The loop is modelled as a small state machine so the cap and the backoff
//! source can be checked without a network: every rate-limited attempt asks
//! [`RetryPolicy::next_step`] whether to back off or give up.

use crate::error::AppError;
use crate::models::Provider;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Sleep, then issue attempt `next_attempt`.
    Backoff {
        delay: Duration,
        next_attempt: u32,
    },
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub default_backoff: Duration,
    /// Response header carrying the provider's retry hint in seconds.
    pub retry_after_header: &'static str,
}

impl RetryPolicy {
    pub fn azure() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            default_backoff: DEFAULT_BACKOFF,
            retry_after_header: "x-ms-ratelimit-microsoft.costmanagement-entity-retry-after",
        }
    }

    /// Transition taken after attempt `attempt` (1-based) was rate limited.
    pub fn next_step(&self, attempt: u32, hint: Option<Duration>) -> RetryStep {
        if attempt >= self.max_attempts {
            return RetryStep::Exhausted;
        }
        RetryStep::Backoff {
            delay: hint.unwrap_or(self.default_backoff),
            next_attempt: attempt + 1,
        }
    }

    fn retry_hint(&self, response: &Response) -> Option<Duration> {
        response
            .headers()
            .get(self.retry_after_header)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// Sends a request until it succeeds, backing off on 429.
///
/// Any other non-200 status fails immediately with the response body as the
/// message.
pub async fn send_with_backoff<F, Fut>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    provider: Provider,
    make_request: F,
) -> Result<Response, AppError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Response, reqwest::Error>>,
{
    let mut attempt = 1;
    loop {
        let response = make_request().await?;
        let status = response.status();

        if status == StatusCode::OK {
            if attempt > 1 {
                debug!(provider = %provider, attempt, "request succeeded after backoff");
            }
            return Ok(response);
        }

        if status != StatusCode::TOO_MANY_REQUESTS {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                provider,
                status: status.as_u16(),
                message,
            });
        }

        match policy.next_step(attempt, policy.retry_hint(&response)) {
            RetryStep::Backoff {
                delay,
                next_attempt,
            } => {
                warn!(
                    provider = %provider,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_secs = delay.as_secs(),
                    "rate limited, backing off"
                );
                sleeper.sleep(delay).await;
                attempt = next_attempt;
            }
            RetryStep::Exhausted => {
                return Err(AppError::RetryExhausted {
                    provider,
                    attempts: attempt,
                });
            }
        }
    }
}
