//! Utilities to test code provisioning branches without a Neon account.
//!
//! [`MockNeonApi`] is a scripted in-memory provider recording every call, [`RecordingSleeper`]
//! and [`FixedJitter`] make retries and polling loops deterministic and instantaneous.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use config::shared::NeonConfig;

use crate::retry::{JitterSource, RateLimitedCaller, RetryPolicy, Sleeper};

mod mock;

pub use mock::*;

/// [`Sleeper`] returning immediately and recording every requested duration.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    /// Returns every duration slept so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    /// Returns the sum of every duration slept so far.
    pub fn total(&self) -> Duration {
        self.sleeps.lock().unwrap().iter().sum()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        // Let other tasks progress as a real sleep would.
        tokio::task::yield_now().await;
    }
}

/// [`JitterSource`] always returning the same sample.
///
/// A sample of `0.5` yields no jitter at all.
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Creates a caller with the default policy, no jitter and the given sleeper.
pub fn test_caller(sleeper: Arc<RecordingSleeper>) -> RateLimitedCaller {
    RateLimitedCaller::new(RetryPolicy::default())
        .with_sleeper(sleeper)
        .with_jitter(Arc::new(FixedJitter(0.5)))
}

/// Creates a configuration for the project used by [`MockNeonApi`].
pub fn test_config() -> NeonConfig {
    NeonConfig::new("test-api-key", MOCK_PROJECT_ID)
}
