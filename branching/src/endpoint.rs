use std::time::Duration;

use api::models::EndpointState;
use tracing::debug;

use crate::bail;
use crate::error::{BranchResult, ErrorKind};
use crate::provider::{DEFAULT_POLL_INTERVAL, ProviderClient};

/// How long to wait for a new endpoint to become active.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(60);

/// Polls an endpoint until it accepts connections.
#[derive(Debug, Clone, Copy)]
pub struct EndpointWaiter {
    timeout: Duration,
    interval: Duration,
}

impl Default for EndpointWaiter {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_ENDPOINT_TIMEOUT,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl EndpointWaiter {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Waits until `endpoint_id` is active and returns its host.
    ///
    /// Time is accounted in poll intervals, so the time spent in provider calls does not count
    /// towards the timeout.
    pub async fn wait(&self, provider: &ProviderClient, endpoint_id: &str) -> BranchResult<String> {
        let mut waited = Duration::ZERO;

        loop {
            let endpoint = provider.endpoint_status(endpoint_id).await?;

            if endpoint.current_state == EndpointState::Active {
                debug!(endpoint_id, host = %endpoint.host, "endpoint is active");
                return Ok(endpoint.host);
            }

            if waited >= self.timeout {
                bail!(
                    ErrorKind::EndpointTimeout,
                    "Timed out waiting for the endpoint to become active",
                    format!(
                        "endpoint {endpoint_id} not active after {:.1}s (current state: {})",
                        self.timeout.as_secs_f64(),
                        endpoint.current_state
                    )
                );
            }

            provider.caller().sleeper().sleep(self.interval).await;
            waited += self.interval;
        }
    }
}
