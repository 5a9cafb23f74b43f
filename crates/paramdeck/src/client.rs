//! Dynamic parameter evaluation client.
//!
//! One [`ConnectionHandle`] owns one WebSocket to the backend's evaluation
//! service for a (template version, owner) pair. The connection runs in a
//! background task; inbound snapshots, transport errors and unexpected
//! closes are delivered to a [`ParameterHandler`] on that task, in order.
//!
//! State machine: `Connecting -> Open -> {Closed, Errored}`. Both end
//! states are terminal and the client never reconnects on its own.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use paramdeck_telemetry::{log_connection_closed, log_connection_failed, MetricsRegistry};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use crate::config::{ClientConfig, SESSION_TOKEN_HEADER};
use crate::error::{ClientError, ConnectionError};
use crate::protocol::{DynamicParametersRequest, DynamicParametersResponse, Inputs};

/// Lifecycle of a single evaluation connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    /// `Closed` and `Errored` accept no further sends.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// Callbacks invoked by the connection task.
pub trait ParameterHandler: Send + 'static {
    /// A snapshot arrived. Ordering against earlier snapshots is the
    /// receiver's concern.
    fn on_message(&mut self, response: DynamicParametersResponse);

    /// The transport failed or the server violated the wire format.
    fn on_error(&mut self, error: ConnectionError);

    /// The server closed the connection without the caller asking.
    fn on_close(&mut self);
}

/// Connection callbacks as values, for consumers that run their own loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Message(DynamicParametersResponse),
    Error(ConnectionError),
    Closed,
}

/// [`ParameterHandler`] that forwards every callback into a channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: ConnectionEvent) {
        // The receiver going away means nobody is listening anymore.
        let _ = self.tx.send(event);
    }
}

impl ParameterHandler for ChannelHandler {
    fn on_message(&mut self, response: DynamicParametersResponse) {
        self.forward(ConnectionEvent::Message(response));
    }

    fn on_error(&mut self, error: ConnectionError) {
        self.forward(ConnectionEvent::Error(error));
    }

    fn on_close(&mut self) {
        self.forward(ConnectionEvent::Closed);
    }
}

/// Opens evaluation connections.
#[derive(Clone)]
pub struct DynamicParameterClient {
    config: ClientConfig,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl DynamicParameterClient {
    /// Create a new client.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            metrics: None,
        }
    }

    /// Record connection activity in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    /// Open a connection for `version_id` on behalf of `owner_id`.
    ///
    /// Returns as soon as the background task is spawned; the handle starts
    /// in [`ConnectionState::Connecting`]. Must be called within a tokio
    /// runtime.
    pub fn open<H: ParameterHandler>(
        &self,
        version_id: Uuid,
        owner_id: Uuid,
        handler: H,
    ) -> Result<ConnectionHandle, ClientError> {
        let url = self.config.dynamic_parameters_url(version_id, owner_id)?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::Config(format!("invalid websocket request: {e}")))?;
        if let Some(token) = &self.config.session_token {
            let value = HeaderValue::from_str(token)
                .map_err(|_| ClientError::Config("session token is not a valid header value".to_string()))?;
            request
                .headers_mut()
                .insert(HeaderName::from_static(SESSION_TOKEN_HEADER), value);
        }

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue);

        let shared = Arc::new(Shared {
            state: state_tx,
            close_requested: AtomicBool::new(false),
            metrics: self.metrics.clone(),
        });

        tracing::debug!(
            version_id = %version_id,
            owner_id = %owner_id,
            url = %url,
            "Opening dynamic parameters connection"
        );

        let task = ConnectionTask {
            shared: Arc::clone(&shared),
            version_id,
            sent_at: BTreeMap::new(),
        };
        tokio::spawn(task.run(request, handler, outbound_rx, shutdown_rx));

        Ok(ConnectionHandle {
            shared,
            version_id,
            owner_id,
            next_id: AtomicI64::new(0),
            outbound: outbound_tx,
            shutdown: shutdown_tx,
        })
    }
}

/// State shared between a handle and its connection task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    close_requested: AtomicBool,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Shared {
    /// Move to `to` unless already terminal. Returns whether it moved.
    fn transition(&self, to: ConnectionState) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == to {
                return false;
            }
            *state = to;
            true
        })
    }

    fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }
}

/// Exclusive handle to one evaluation connection.
///
/// Dropping the handle closes the connection.
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    version_id: Uuid,
    owner_id: Uuid,
    next_id: AtomicI64,
    outbound: mpsc::Sender<DynamicParametersRequest>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionHandle {
    pub fn version_id(&self) -> Uuid {
        self.version_id
    }

    pub fn owner_id(&self) -> Uuid {
        self.owner_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the connection leaves `Connecting`.
    pub async fn wait_until_settled(&self) -> ConnectionState {
        let mut rx = self.shared.state.subscribe();
        let settled = rx
            .wait_for(|state| *state != ConnectionState::Connecting)
            .await
            .map(|state| *state);
        // The sender lives in `shared`, which this handle keeps alive.
        settled.unwrap_or(ConnectionState::Closed)
    }

    /// Send the full input mapping under the next sequence number.
    ///
    /// Returns the id used, or `None` when the request was dropped because
    /// the connection is not open or the outbound queue is full.
    pub fn send(&self, inputs: Inputs) -> Option<i64> {
        let state = self.state();
        if state != ConnectionState::Open {
            tracing::debug!(state = ?state, "Dropping parameter request, connection not open");
            self.record_request(false);
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = DynamicParametersRequest {
            id,
            owner_id: self.owner_id.to_string(),
            inputs,
        };

        match self.outbound.try_send(request) {
            Ok(()) => Some(id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(id, "Dropping parameter request, outbound queue full");
                self.record_request(false);
                None
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.record_request(false);
                None
            }
        }
    }

    /// Close the connection. Idempotent; never invokes `on_close`.
    pub fn close(&self) {
        if self.shared.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
    }

    fn record_request(&self, sent: bool) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_request(sent);
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Why the message loop stopped.
enum Ending {
    Requested,
    ClosedByPeer,
    Failed(ConnectionError),
}

struct ConnectionTask {
    shared: Arc<Shared>,
    version_id: Uuid,
    /// Send time per request id, for round-trip metrics.
    sent_at: BTreeMap<i64, Instant>,
}

impl ConnectionTask {
    async fn run<H: ParameterHandler>(
        mut self,
        request: tokio_tungstenite::tungstenite::handshake::client::Request,
        mut handler: H,
        mut outbound_rx: mpsc::Receiver<DynamicParametersRequest>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let connected = tokio::select! {
            _ = shutdown_rx.wait_for(|closing| *closing) => {
                self.shared.transition(ConnectionState::Closed);
                return;
            }
            result = connect_async(request) => result,
        };

        let ws_stream = match connected {
            Ok((ws_stream, _response)) => ws_stream,
            Err(e) => {
                let error = ConnectionError::Failed(e.to_string());
                if self.shared.transition(ConnectionState::Errored) && !self.shared.close_requested() {
                    self.record_failure("connect");
                    log_connection_failed!(version_id = %self.version_id, error = %error);
                    handler.on_error(error);
                }
                return;
            }
        };

        let (mut sender, mut receiver) = ws_stream.split();

        if *shutdown_rx.borrow_and_update() {
            let _ = sender.send(Message::Close(None)).await;
            self.shared.transition(ConnectionState::Closed);
            return;
        }

        self.shared.transition(ConnectionState::Open);
        if let Some(metrics) = &self.shared.metrics {
            metrics.connection_opened();
        }

        let ending = loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let _ = sender.send(Message::Close(None)).await;
                        break Ending::Requested;
                    }
                }

                Some(request) = outbound_rx.recv() => {
                    let json = match serde_json::to_string(&request) {
                        Ok(json) => json,
                        Err(e) => break Ending::Failed(ConnectionError::Protocol(e.to_string())),
                    };

                    if let Err(e) = sender.send(Message::Text(json.into())).await {
                        break Ending::Failed(ConnectionError::Failed(e.to_string()));
                    }

                    if let Some(metrics) = &self.shared.metrics {
                        metrics.record_request(true);
                        self.sent_at.insert(request.id, Instant::now());
                    }
                    tracing::trace!(id = request.id, inputs = request.inputs.len(), "Parameter request sent");
                }

                frame = receiver.next() => {
                    let payload = match frame {
                        Some(Ok(Message::Text(text))) => serde_json::from_str::<DynamicParametersResponse>(&text),
                        Some(Ok(Message::Binary(data))) => serde_json::from_slice::<DynamicParametersResponse>(&data),
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sender.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => break Ending::ClosedByPeer,
                        Some(Err(e)) => break Ending::Failed(ConnectionError::Failed(e.to_string())),
                        Some(Ok(_)) => continue,
                    };

                    match payload {
                        Ok(response) => {
                            self.observe_round_trip(response.id);
                            handler.on_message(response);
                        }
                        Err(e) => {
                            let _ = sender.send(Message::Close(None)).await;
                            break Ending::Failed(ConnectionError::Protocol(e.to_string()));
                        }
                    }
                }
            }
        };

        if let Some(metrics) = &self.shared.metrics {
            metrics.connection_closed();
        }

        match ending {
            Ending::Requested => {
                self.shared.transition(ConnectionState::Closed);
                log_connection_closed!(version_id = %self.version_id, requested = true);
            }
            Ending::ClosedByPeer => {
                if self.shared.transition(ConnectionState::Closed) && !self.shared.close_requested() {
                    self.record_failure("closed");
                    log_connection_closed!(version_id = %self.version_id, requested = false);
                    handler.on_close();
                }
            }
            Ending::Failed(error) => {
                if self.shared.transition(ConnectionState::Errored) && !self.shared.close_requested() {
                    self.record_failure(error.kind());
                    log_connection_failed!(version_id = %self.version_id, error = %error);
                    handler.on_error(error);
                }
            }
        }
    }

    fn observe_round_trip(&mut self, id: i64) {
        let Some(metrics) = &self.shared.metrics else {
            return;
        };
        if let Some(sent) = self.sent_at.get(&id) {
            metrics.record_round_trip(sent.elapsed().as_secs_f64());
        }
        // Older requests will never be answered usefully.
        self.sent_at = self.sent_at.split_off(&id.saturating_add(1));
    }

    fn record_failure(&self, kind: &str) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_connection_failure(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn client_for(port: u16) -> DynamicParameterClient {
        let config = ClientConfig::new(&format!("http://127.0.0.1:{port}")).unwrap();
        DynamicParameterClient::new(config)
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Open.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Errored.is_terminal());
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let client = client_for(unused_port());
        let (handler, mut events) = ChannelHandler::new();

        let handle = client.open(Uuid::new_v4(), Uuid::new_v4(), handler).unwrap();
        assert_eq!(handle.wait_until_settled().await, ConnectionState::Errored);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ConnectionEvent::Error(e) => assert!(e.to_string().contains("connection failed")),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_on_unopened_handle_is_dropped() {
        let client = client_for(unused_port());
        let (handler, _events) = ChannelHandler::new();
        let handle = client.open(Uuid::new_v4(), Uuid::new_v4(), handler).unwrap();

        let mut inputs = Inputs::new();
        inputs.insert("region".to_string(), "us-east".to_string());
        assert_eq!(handle.send(inputs.clone()), None);

        handle.wait_until_settled().await;
        assert_eq!(handle.send(inputs), None);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let client = client_for(unused_port());
        let (handler, mut events) = ChannelHandler::new();
        let handle = client.open(Uuid::new_v4(), Uuid::new_v4(), handler).unwrap();

        handle.close();
        handle.close();
        let state = handle.wait_until_settled().await;
        assert!(state.is_terminal());
        handle.close();

        // A requested close never reaches the handler.
        drop(handle);
        let next = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(!matches!(next, Ok(Some(ConnectionEvent::Closed))));
    }

    #[test]
    fn test_nil_version_rejected_before_spawning() {
        let client = client_for(80);
        let (handler, _events) = ChannelHandler::new();
        assert!(client.open(Uuid::nil(), Uuid::new_v4(), handler).is_err());
    }
}
