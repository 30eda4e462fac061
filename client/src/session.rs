//! Relay session
//!
//! Owns the control connection to the tunnel server. Every inbound request
//! is handled by its own task, so a slow local call never holds up the
//! next frame; responses go back in completion order, correlated only by
//! `request_id`. A single writer task owns the WebSocket sink.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relaytap_shared::protocol::{ControlMessage, TunnelInfo, TunnelRequest};
use relaytap_shared::{Error, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::history::InspectedExchange;
use crate::inspector::InspectorHub;
use crate::proxy::Forwarder;

type ControlStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Upper bound on establishing the control connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Outbound frames queued for the writer task
const OUTBOUND_BUFFER: usize = 256;

/// How long `close` waits for the writer to flush
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why the receive loop stopped
enum Exit {
    Shutdown,
    PeerClosed,
    Failed(Error),
}

pub struct RelaySession {
    state: SessionState,
    forwarder: Forwarder,
    inspector: Option<InspectorHub>,
    replay_rx: Option<mpsc::Receiver<InspectedExchange>>,
    identity: Option<TunnelInfo>,
    reader: Option<SplitStream<ControlStream>>,
    outbound: Option<mpsc::Sender<Message>>,
    writer: Option<JoinHandle<()>>,
}

impl RelaySession {
    pub fn new(forwarder: Forwarder) -> Self {
        Self {
            state: SessionState::Disconnected,
            forwarder,
            inspector: None,
            replay_rx: None,
            identity: None,
            reader: None,
            outbound: None,
            writer: None,
        }
    }

    /// Mirror traffic to `hub` and serve its replays. The session owns the
    /// hub from here on and closes it on shutdown.
    pub fn with_inspector(mut self, hub: InspectorHub, replay_rx: mpsc::Receiver<InspectedExchange>) -> Self {
        self.inspector = Some(hub);
        self.replay_rx = Some(replay_rx);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Tunnel identity announced by the server, once known
    pub fn identity(&self) -> Option<&TunnelInfo> {
        self.identity.as_ref()
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session {} → {}", self.state, next);
        self.state = next;
    }

    /// Establish the control connection
    pub async fn open(&mut self, endpoint: &str, subdomain: Option<&str>, token: Option<&str>) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(Error::InvalidState(format!("cannot open a {} session", self.state)));
        }

        let url = control_url(endpoint, subdomain, token)?;
        self.transition(SessionState::Connecting);
        info!("Connecting to tunnel server: {}", endpoint);

        let connected = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                self.transition(SessionState::Disconnected);
                return Err(Error::Connection(format!("failed to connect to {}: {}", endpoint, e)));
            }
            Err(_) => {
                self.transition(SessionState::Disconnected);
                return Err(Error::Timeout);
            }
        };

        let (sink, reader) = connected.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.writer = Some(tokio::spawn(write_loop(sink, rx)));
        self.outbound = Some(tx);
        self.reader = Some(reader);
        self.transition(SessionState::Connected);
        Ok(())
    }

    /// Relay requests until the server closes the tunnel, reports an error,
    /// or `shutdown` resolves. The session is closed on return.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.state != SessionState::Connected {
            return Err(Error::InvalidState(format!("cannot run a {} session", self.state)));
        }
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| Error::Connection("control connection is not open".into()))?;
        let mut replay_rx = self.replay_rx.take();
        let mut tasks = JoinSet::new();
        tokio::pin!(shutdown);

        let exit = loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(exit) = self.handle_frame(&text, &mut tasks).await {
                            break exit;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            if let Some(exit) = self.handle_frame(text, &mut tasks).await {
                                break exit;
                            }
                        }
                        Err(_) => warn!("Discarding non UTF-8 binary frame ({} bytes)", data.len()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!("Tunnel server closed the connection: {:?}", frame);
                        break Exit::PeerClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("Control connection error: {}", e);
                        break Exit::Failed(Error::Connection(e.to_string()));
                    }
                    None => {
                        info!("Control connection closed");
                        break Exit::PeerClosed;
                    }
                },
                Some(exchange) = next_replay(&mut replay_rx) => self.replay(exchange, &mut tasks).await,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Request task failed: {}", e);
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down...");
                    break Exit::Shutdown;
                }
            }
        };

        self.transition(SessionState::Closing);
        drop(reader);

        let result = match exit {
            Exit::Shutdown => {
                self.drain(&mut tasks).await;
                Ok(())
            }
            Exit::PeerClosed => {
                abort_in_flight(&mut tasks).await;
                Ok(())
            }
            Exit::Failed(e) => {
                abort_in_flight(&mut tasks).await;
                Err(e)
            }
        };

        self.close().await;
        result
    }

    /// Decode and act on one frame. Returns an exit reason when the frame
    /// ends the session.
    async fn handle_frame(&mut self, text: &str, tasks: &mut JoinSet<()>) -> Option<Exit> {
        let message = match ControlMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed frame: {}", e);
                return None;
            }
        };

        match message {
            ControlMessage::Connected(info) => {
                info!("Tunnel {} assigned {}", info.tunnel_id, info.public_url);
                print_banner(&info, &self.forwarder.target());
                self.identity = Some(info);
                None
            }
            ControlMessage::Request(request) => {
                self.dispatch(request, self.outbound.clone(), tasks).await;
                None
            }
            ControlMessage::Error { error } => {
                error!("Tunnel server reported an error: {}", error);
                Some(Exit::Failed(Error::Remote(error)))
            }
            other => {
                debug!("Ignoring unexpected {} frame", other.kind());
                None
            }
        }
    }

    /// Record the request in arrival order, then hand it to its own task
    async fn dispatch(&self, request: TunnelRequest, outbound: Option<mpsc::Sender<Message>>, tasks: &mut JoinSet<()>) {
        if let Some(hub) = &self.inspector {
            hub.record_request(InspectedExchange::from_request(&request)).await;
        }
        tasks.spawn(relay_request(
            self.forwarder.clone(),
            self.inspector.clone(),
            outbound,
            request,
        ));
    }

    /// Re-run a recorded exchange against the local service. The server
    /// never issued the new id, so nothing is written back.
    async fn replay(&self, exchange: InspectedExchange, tasks: &mut JoinSet<()>) {
        let request = exchange.to_replay(format!("replay-{}", uuid::Uuid::new_v4()));
        info!("Replaying {} as {}", exchange.id, request.request_id);
        self.dispatch(request, None, tasks).await;
    }

    /// Let in-flight requests finish, bounded by the forward timeout
    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        let grace = self.forwarder.timeout() + Duration::from_secs(1);
        info!("Waiting for {} in-flight request(s)", tasks.len());
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            abort_in_flight(tasks).await;
        }
    }

    /// Release the transport and the owned inspector. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state != SessionState::Closing {
            self.transition(SessionState::Closing);
        }

        self.reader = None;
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None)).await;
        }
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
                warn!("Control connection writer did not stop in time");
            }
        }
        if let Some(hub) = &self.inspector {
            hub.close().await;
        }

        self.transition(SessionState::Closed);
        info!("Tunnel closed");
    }
}

/// Build the control endpoint with the optional `subdomain` and `token`
/// query parameters
pub fn control_url(endpoint: &str, subdomain: Option<&str>, token: Option<&str>) -> Result<url::Url> {
    let mut url = url::Url::parse(endpoint)
        .map_err(|e| Error::Connection(format!("invalid server endpoint '{}': {}", endpoint, e)))?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(subdomain) = subdomain {
            query.append_pair("subdomain", subdomain);
        }
        if let Some(token) = token {
            query.append_pair("token", token);
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}

/// Forward, mirror the outcome, respond
async fn relay_request(
    forwarder: Forwarder,
    inspector: Option<InspectorHub>,
    outbound: Option<mpsc::Sender<Message>>,
    request: TunnelRequest,
) {
    info!("{} {} → {}", request.method, request.path, forwarder.target());

    let forwarded = forwarder
        .forward(&request.method, &request.path, &request.headers, request.body.as_deref())
        .await;
    debug!("{} answered {} in {}ms", request.request_id, forwarded.status, forwarded.duration_ms);

    if let Some(hub) = &inspector {
        hub.record_response(&request.request_id, forwarded.outcome()).await;
    }

    let Some(outbound) = outbound else {
        return;
    };
    let request_id = request.request_id;
    match ControlMessage::Response(forwarded.into_response(request_id.clone())).encode() {
        Ok(text) => {
            if outbound.send(Message::Text(text)).await.is_err() {
                warn!("Control connection closed before response {} was sent", request_id);
            }
        }
        Err(e) => error!("Failed to encode response {}: {}", request_id, e),
    }
}

/// Sole owner of the WebSocket sink
async fn write_loop(mut sink: SplitSink<ControlStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("Control connection write failed: {}", e);
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn next_replay(rx: &mut Option<mpsc::Receiver<InspectedExchange>>) -> Option<InspectedExchange> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn abort_in_flight(tasks: &mut JoinSet<()>) {
    if !tasks.is_empty() {
        warn!("Abandoning {} in-flight request(s)", tasks.len());
    }
    tasks.shutdown().await;
}

fn print_banner(info: &TunnelInfo, local: &str) {
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  🚀 Relaytap Active                                          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Public URL: {:<47} ║", info.public_url);
    println!("║  Subdomain:  {:<47} ║", info.subdomain);
    println!("║  Local:      http://{:<40} ║", local);
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");
}
