//! TestEvaluator: scriptable stand-in for the dynamic parameter service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use paramdeck_lib::config::SESSION_TOKEN_HEADER;
use paramdeck_lib::protocol::{
    DynamicParametersRequest, DynamicParametersResponse, NullHclString, PreviewParameter,
};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::TestError;

/// Maps an inbound request to the snapshot to answer with, if any.
pub type Responder = Arc<dyn Fn(&DynamicParametersRequest) -> Option<DynamicParametersResponse> + Send + Sync>;

/// How often the wait helpers poll, and for how long.
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const MAX_ATTEMPTS: usize = 250;

/// One accepted WebSocket handshake.
#[derive(Debug, Clone)]
pub struct AcceptedConnection {
    pub path: String,
    pub query: Option<String>,
    pub session_token: Option<String>,
}

/// Connection lifecycle as seen by the server, indexed by accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    Accepted(usize),
    /// The client sent a close frame or dropped the socket.
    ClientClosed(usize),
}

enum Control {
    Respond(DynamicParametersResponse),
    Raw(String),
    Close,
}

#[derive(Default)]
struct Recorded {
    connections: Vec<AcceptedConnection>,
    requests: Vec<DynamicParametersRequest>,
    events: Vec<ServerEvent>,
    live: Vec<mpsc::UnboundedSender<Control>>,
}

struct Shared {
    initial: DynamicParametersResponse,
    responder: Responder,
    recorded: Mutex<Recorded>,
}

/// In-process evaluation service.
///
/// Every connection first receives the initial snapshot (id `-1`), then
/// each request is recorded and passed to the responder. Tests can also
/// push snapshots, raw frames or a close onto the newest connection.
pub struct TestEvaluator {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl TestEvaluator {
    /// Start a service that answers every request by echoing its inputs
    /// back as parameter values.
    pub async fn start(parameters: Vec<PreviewParameter>) -> Result<Self, TestError> {
        let responder = echo(parameters.clone());
        Self::with_responder(parameters, responder).await
    }

    /// Start a service that never answers on its own.
    pub async fn silent(parameters: Vec<PreviewParameter>) -> Result<Self, TestError> {
        let responder: Responder = Arc::new(|_: &DynamicParametersRequest| None);
        Self::with_responder(parameters, responder).await
    }

    /// Start a service answering with `responder`.
    pub async fn with_responder(parameters: Vec<PreviewParameter>, responder: Responder) -> Result<Self, TestError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            initial: DynamicParametersResponse {
                id: -1,
                parameters,
                diagnostics: Vec::new(),
            },
            responder,
            recorded: Mutex::new(Recorded::default()),
        });

        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));

        Ok(Self { addr, shared, accept })
    }

    /// Base URL to hand to `ClientConfig::with_websocket_url`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connections(&self) -> Vec<AcceptedConnection> {
        self.shared.recorded.lock().connections.clone()
    }

    pub fn events(&self) -> Vec<ServerEvent> {
        self.shared.recorded.lock().events.clone()
    }

    /// Every request received, across connections, in arrival order.
    pub fn requests(&self) -> Vec<DynamicParametersRequest> {
        self.shared.recorded.lock().requests.clone()
    }

    /// Send a snapshot on the newest connection.
    pub fn respond(&self, response: DynamicParametersResponse) -> bool {
        self.control(Control::Respond(response))
    }

    /// Send a text frame verbatim on the newest connection.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.control(Control::Raw(text.into()))
    }

    /// Close the newest connection from the server side.
    pub fn close_connection(&self) -> bool {
        self.control(Control::Close)
    }

    /// Wait until at least `count` requests were received.
    pub async fn wait_for_requests(&self, count: usize) -> Result<Vec<DynamicParametersRequest>, TestError> {
        for _ in 0..MAX_ATTEMPTS {
            let requests = self.requests();
            if requests.len() >= count {
                return Ok(requests);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(TestError::Timeout(format!(
            "expected {count} requests, received {}",
            self.requests().len()
        )))
    }

    /// Wait until at least `count` connections were accepted.
    pub async fn wait_for_connections(&self, count: usize) -> Result<Vec<AcceptedConnection>, TestError> {
        for _ in 0..MAX_ATTEMPTS {
            let connections = self.connections();
            if connections.len() >= count {
                return Ok(connections);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        Err(TestError::Timeout(format!(
            "expected {count} connections, accepted {}",
            self.connections().len()
        )))
    }

    fn control(&self, control: Control) -> bool {
        let recorded = self.shared.recorded.lock();
        match recorded.live.last() {
            Some(tx) => tx.send(control).is_ok(),
            None => false,
        }
    }
}

impl Drop for TestEvaluator {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Responder that reflects request inputs into `parameters`.
pub fn echo(parameters: Vec<PreviewParameter>) -> Responder {
    Arc::new(move |request: &DynamicParametersRequest| {
        let parameters = parameters
            .iter()
            .cloned()
            .map(|mut parameter| {
                if let Some(value) = request.inputs.get(&parameter.name) {
                    parameter.value = NullHclString::known(value.clone());
                }
                parameter
            })
            .collect();

        Some(DynamicParametersResponse {
            id: request.id,
            parameters,
            diagnostics: Vec::new(),
        })
    })
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while let Ok((stream, _)) = listener.accept().await {
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            // A failed connection only affects the test that caused it.
            let _ = serve(stream, shared).await;
        });
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) -> Result<(), TestError> {
    let mut accepted = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        accepted = Some(AcceptedConnection {
            path: request.uri().path().to_string(),
            query: request.uri().query().map(str::to_string),
            session_token: request
                .headers()
                .get(SESSION_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        });
        Ok(response)
    };
    let ws_stream = accept_hdr_async(stream, callback).await?;

    let (tx, mut control) = mpsc::unbounded_channel();
    let index = {
        let mut recorded = shared.recorded.lock();
        let index = recorded.live.len();
        recorded.connections.extend(accepted);
        recorded.events.push(ServerEvent::Accepted(index));
        recorded.live.push(tx);
        index
    };

    let (mut sender, mut receiver) = ws_stream.split();
    send_snapshot(&mut sender, &shared.initial).await?;

    loop {
        tokio::select! {
            command = control.recv() => match command {
                Some(Control::Respond(response)) => send_snapshot(&mut sender, &response).await?,
                Some(Control::Raw(text)) => sender.send(Message::Text(text.into())).await?,
                Some(Control::Close) | None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let request: DynamicParametersRequest = serde_json::from_str(text.as_str())?;
                    shared.recorded.lock().requests.push(request.clone());
                    if let Some(response) = (shared.responder)(&request) {
                        send_snapshot(&mut sender, &response).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    shared.recorded.lock().events.push(ServerEvent::ClientClosed(index));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
        }
    }

    Ok(())
}

async fn send_snapshot(
    sender: &mut SplitSink<WebSocketStream<TcpStream>, Message>,
    response: &DynamicParametersResponse,
) -> Result<(), TestError> {
    let json = serde_json::to_string(response)?;
    sender.send(Message::Text(json.into())).await?;
    Ok(())
}
