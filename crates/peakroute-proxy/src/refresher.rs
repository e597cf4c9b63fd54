//! Background endpoint and credential refresh

use peakroute_api::ManagementApi;
use peakroute_dialer::OpContext;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wait after a successful refresh and after a failed one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSchedule {
    pub success: Duration,
    pub retry: Duration,
}

impl Default for RefreshSchedule {
    fn default() -> Self {
        Self {
            success: Duration::from_secs(4 * 60 * 60),
            retry: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    SuccessWait,
    RetryWait,
}

impl RefreshState {
    pub fn interval(&self, schedule: &RefreshSchedule) -> Duration {
        match self {
            RefreshState::SuccessWait => schedule.success,
            RefreshState::RetryWait => schedule.retry,
        }
    }
}

/// Re-runs discovery forever on a success/retry cadence.
///
/// A successful `discover` swaps the API client's endpoint and credentials in
/// one step; the refresher only decides when to call it.
pub struct Refresher {
    api: Arc<dyn ManagementApi>,
    region: String,
    schedule: RefreshSchedule,
    timeout: Duration,
}

impl Refresher {
    pub fn new(
        api: Arc<dyn ManagementApi>,
        region: impl Into<String>,
        schedule: RefreshSchedule,
        timeout: Duration,
    ) -> Self {
        Self {
            api,
            region: region.into(),
            schedule,
            timeout,
        }
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    /// Loop until `token` is cancelled, starting with a full success wait
    pub async fn run(self, token: CancellationToken) {
        let mut state = RefreshState::SuccessWait;

        loop {
            let wait = state.interval(&self.schedule);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            state = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = self.refresh_once(&token) => next,
            };
        }

        info!("Endpoint refresher stopped");
    }

    /// One discovery attempt; returns the state to wait in next
    pub async fn refresh_once(&self, token: &CancellationToken) -> RefreshState {
        info!("Refreshing device endpoint...");
        let ctx = OpContext::from_token(token.child_token()).timeout(self.timeout);

        match self.api.discover(&ctx, &self.region).await {
            Ok(endpoint) if !endpoint.is_empty() => {
                info!(endpoint = %endpoint, "Device endpoint refreshed");
                RefreshState::SuccessWait
            }
            Ok(_) => {
                error!(region = %self.region, "Endpoint refresh returned no addresses");
                RefreshState::RetryWait
            }
            Err(e) => {
                error!(region = %self.region, error = %e, "Endpoint refresh failed");
                RefreshState::RetryWait
            }
        }
    }
}
