//! Retries of Neon API calls rejected by the provider's rate limit.
//!
//! Only rate limit errors are retried, with exponential backoff and jitter unless the provider
//! suggests a delay through `Retry-After`. Every other error is returned immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use api::ApiError;
use async_trait::async_trait;
use tracing::warn;

use crate::bail;
use crate::branch_error;
use crate::error::{BranchResult, ErrorKind};

/// Delay before the first retry when the provider gives no hint.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(4);

/// Relative jitter applied to computed delays, `0.25` meaning ±25%.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.25;

/// Upper bound on the cumulative time spent sleeping for one operation.
pub const DEFAULT_MAX_TOTAL_DELAY: Duration = Duration::from_secs(90);

/// Upper bound on the number of retries for one operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Smallest delay honored when the provider sends a `Retry-After` hint.
const MIN_RETRY_AFTER_SECS: f64 = 0.1;

/// Bounds of the retry loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub jitter_factor: f64,
    pub max_total_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_total_delay: DEFAULT_MAX_TOTAL_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Suspends the current task, injectable so tests never wait for real.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by [`tokio::time::sleep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Source of uniformly distributed samples in `[0, 1)`.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

/// [`JitterSource`] backed by the thread-local random generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// Runs provider calls, retrying them while the provider reports a rate limit.
#[derive(Clone)]
pub struct RateLimitedCaller {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    jitter: Arc<dyn JitterSource>,
}

impl RateLimitedCaller {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(TokioSleeper),
            jitter: Arc::new(RandomJitter),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the sleeper, shared with the polling loops built on top of this caller.
    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    /// Computes the delay before the retry following the 0-indexed `attempt`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<f64>) -> Duration {
        if let Some(retry_after) = retry_after {
            return Duration::from_secs_f64(retry_after.max(MIN_RETRY_AFTER_SECS));
        }

        let exponential =
            self.policy.base_delay.as_secs_f64() * 2f64.powi(attempt.min(i32::MAX as u32) as i32);
        let jitter = self.policy.jitter_factor * (2.0 * self.jitter.sample() - 1.0);

        Duration::from_secs_f64((exponential * (1.0 + jitter)).max(0.0))
    }

    /// Runs `operation`, retrying it while it fails with a rate limit error.
    ///
    /// The retry loop gives up with [`ErrorKind::RateLimitExhausted`] when the next delay would
    /// push the cumulative delay past the policy's bound, or when the number of retries reaches
    /// the maximum. Any other error is returned as [`ErrorKind::ProviderRequestFailed`] without
    /// retrying.
    pub async fn call<T, F, Fut>(&self, operation_name: &str, mut operation: F) -> BranchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt: u32 = 0;
        let mut total_delay = Duration::ZERO;

        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_rate_limited() {
                bail!(
                    ErrorKind::ProviderRequestFailed,
                    "Neon API request failed",
                    format!("{operation_name}: {err}"),
                    source: err
                );
            }

            let delay = self.delay_for(attempt, err.retry_after());

            if total_delay + delay > self.policy.max_total_delay {
                bail!(
                    ErrorKind::RateLimitExhausted,
                    "Neon API rate limit retries exhausted",
                    format!(
                        "rate limit exceeded for {operation_name}, max total delay ({:.1}s) reached after {} attempts",
                        self.policy.max_total_delay.as_secs_f64(),
                        attempt + 1
                    ),
                    source: err
                );
            }

            attempt += 1;
            if attempt >= self.policy.max_attempts {
                return Err(branch_error!(
                    ErrorKind::RateLimitExhausted,
                    "Neon API rate limit retries exhausted",
                    format!(
                        "rate limit exceeded for {operation_name}, max attempts ({}) reached after {:.1}s total delay",
                        self.policy.max_attempts,
                        total_delay.as_secs_f64()
                    ),
                    source: err
                ));
            }

            warn!(
                operation = operation_name,
                attempt,
                delay_secs = delay.as_secs_f64(),
                "rate limited by the Neon API, retrying"
            );

            self.sleeper.sleep(delay).await;
            total_delay += delay;
        }
    }
}

impl Default for RateLimitedCaller {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
