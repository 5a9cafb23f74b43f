//! Client configuration.

use std::time::Duration;

use reqwest::Url;
use uuid::Uuid;

use crate::error::ClientError;

/// Header carrying the API session token on REST and WebSocket requests.
/// Lowercase so it can be used as a static header name.
pub const SESSION_TOKEN_HEADER: &str = "coder-session-token";

/// Default timeout for REST requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the outbound request queue per connection.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 32;

/// Configuration shared by the REST and evaluation clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the deployment (`http` or `https`).
    pub url: Url,
    /// Overrides the WebSocket base derived from `url`.
    pub websocket_url: Option<Url>,
    pub session_token: Option<String>,
    pub request_timeout: Duration,
    /// Outbound requests beyond this many queued are dropped.
    pub outbound_queue: usize,
}

impl ClientConfig {
    /// Create a config for the deployment at `url`.
    pub fn new(url: &str) -> Result<Self, ClientError> {
        let url = Url::parse(url).map_err(|e| ClientError::Config(format!("invalid url {url:?}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ClientError::Config(format!(
                "unsupported url scheme {:?}, expected http or https",
                url.scheme()
            )));
        }

        Ok(Self {
            url,
            websocket_url: None,
            session_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        })
    }

    /// Set the session token.
    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Route evaluation connections to a different WebSocket base.
    pub fn with_websocket_url(mut self, url: &str) -> Result<Self, ClientError> {
        let parsed = Url::parse(url)
            .map_err(|e| ClientError::Config(format!("invalid websocket url {url:?}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ClientError::Config(format!(
                "unsupported websocket scheme {:?}, expected ws or wss",
                parsed.scheme()
            )));
        }
        self.websocket_url = Some(parsed);
        Ok(self)
    }

    /// Set the REST request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the outbound queue capacity (minimum 1).
    pub fn with_outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    /// Absolute REST URL for `path` (which starts with `/`).
    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        join(&self.url, path)
    }

    /// WebSocket base: the override, or `url` with `ws`/`wss` swapped in.
    pub fn websocket_base(&self) -> Result<Url, ClientError> {
        if let Some(url) = &self.websocket_url {
            return Ok(url.clone());
        }

        let mut url = self.url.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot derive websocket url from {}", self.url)))?;
        Ok(url)
    }

    /// Evaluation channel for a template version, scoped to an owner.
    pub fn dynamic_parameters_url(&self, version_id: Uuid, owner_id: Uuid) -> Result<Url, ClientError> {
        if version_id.is_nil() {
            return Err(ClientError::Config("template version id must not be empty".to_string()));
        }

        let mut url = join(
            &self.websocket_base()?,
            &format!("/api/v2/templateversions/{version_id}/dynamic-parameters"),
        )?;
        url.query_pairs_mut().append_pair("user_id", &owner_id.to_string());
        Ok(url)
    }
}

fn join(base: &Url, path: &str) -> Result<Url, ClientError> {
    let raw = format!("{}{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&raw).map_err(|e| ClientError::Config(format!("invalid endpoint {raw:?}: {e}")))
}
