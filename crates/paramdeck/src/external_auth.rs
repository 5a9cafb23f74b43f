//! External auth requirements of a template version.
//!
//! Submission is blocked until every non-optional provider is
//! authenticated. While the user completes authentication elsewhere the
//! poller refreshes the provider list on a fixed interval and gives up
//! after a fixed time.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::api::{ApiClient, TemplateVersionExternalAuth};
use crate::error::ClientError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingState {
    Idle,
    Polling,
    /// Gave up before every required provider was authenticated. Polling
    /// may be started again.
    Abandoned,
}

/// Required providers the user has not authenticated with yet.
pub fn missing_required(providers: &[TemplateVersionExternalAuth]) -> Vec<&TemplateVersionExternalAuth> {
    providers
        .iter()
        .filter(|p| !p.optional && !p.authenticated)
        .collect()
}

pub fn has_all_required(providers: &[TemplateVersionExternalAuth]) -> bool {
    missing_required(providers).is_empty()
}

/// Tracks the providers of one template version.
pub struct ExternalAuthPoller {
    api: ApiClient,
    version_id: Uuid,
    interval: Duration,
    timeout: Duration,
    state: watch::Sender<PollingState>,
    providers: watch::Sender<Vec<TemplateVersionExternalAuth>>,
}

impl ExternalAuthPoller {
    pub fn new(api: ApiClient, version_id: Uuid, providers: Vec<TemplateVersionExternalAuth>) -> Self {
        let (state, _) = watch::channel(PollingState::Idle);
        let (providers, _) = watch::channel(providers);
        Self {
            api,
            version_id,
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
            state,
            providers,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> PollingState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PollingState> {
        self.state.subscribe()
    }

    pub fn providers(&self) -> Vec<TemplateVersionExternalAuth> {
        self.providers.borrow().clone()
    }

    pub fn subscribe_providers(&self) -> watch::Receiver<Vec<TemplateVersionExternalAuth>> {
        self.providers.subscribe()
    }

    pub fn has_all_required(&self) -> bool {
        has_all_required(&self.providers.borrow())
    }

    /// Fetch the provider list once and publish it.
    pub async fn refresh(&self) -> Result<Vec<TemplateVersionExternalAuth>, ClientError> {
        let providers = self.api.template_version_external_auth(self.version_id).await?;
        self.providers.send_replace(providers.clone());
        Ok(providers)
    }

    /// Poll until every required provider is authenticated or the timeout
    /// passes. Returns the state polling ended in.
    pub async fn poll(&self) -> PollingState {
        self.state.send_replace(PollingState::Polling);
        let started = Instant::now();

        tracing::info!(
            version_id = %self.version_id,
            interval_ms = self.interval.as_millis() as u64,
            timeout_secs = self.timeout.as_secs(),
            "Polling external auth"
        );

        loop {
            tokio::time::sleep(self.interval).await;

            match self.refresh().await {
                Ok(providers) if has_all_required(&providers) => {
                    self.state.send_replace(PollingState::Idle);
                    tracing::info!(version_id = %self.version_id, "External auth complete");
                    return PollingState::Idle;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(version_id = %self.version_id, error = %e, "External auth refresh failed");
                }
            }

            if started.elapsed() >= self.timeout {
                self.state.send_replace(PollingState::Abandoned);
                tracing::warn!(version_id = %self.version_id, "External auth polling abandoned");
                return PollingState::Abandoned;
            }
        }
    }
}
