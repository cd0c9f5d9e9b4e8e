//! Bounded retry policy shared by connection and health polling.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential { factor: u32, max: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay before the second attempt
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub const fn exponential(attempts: u32, delay: Duration, factor: u32, max: Duration) -> Self {
        Self {
            attempts,
            delay,
            backoff: Backoff::Exponential { factor, max },
        }
    }

    /// Delay slept after the failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max } => {
                let exp = attempt.saturating_sub(1);
                let multiplier = factor.max(1).saturating_pow(exp);
                self.delay.saturating_mul(multiplier).min(max)
            }
        }
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. The last error is returned.
/// A policy with zero attempts still runs once.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(_) => {
                let delay = policy.delay_after(attempt);
                debug!("Attempt {}/{} failed, retrying in {:?}", attempt, attempts, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
