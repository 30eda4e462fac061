//! Request Inspector Dashboard
//!
//! Keeps a bounded history of relayed exchanges and fans live updates out
//! to every connected observer over Server-Sent Events (SSE). Observers are
//! explicit sinks: a sink that cannot take an event is dropped on the spot.

use axum::{
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::{Html, IntoResponse, Sse},
    routing::{get, post},
    Json, Router,
};
use axum::response::sse::{Event, KeepAlive};
use futures_util::stream::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::history::{ExchangeOutcome, History, InspectedExchange};

/// Events buffered per observer before it counts as stalled
const OBSERVER_BUFFER: usize = 256;

/// Event pushed to observers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    Init { exchanges: Vec<InspectedExchange> },
    Request { exchange: InspectedExchange },
    Response { id: String, outcome: ExchangeOutcome },
}

/// Acknowledgement for an accepted replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayAck {
    pub status: &'static str,
    pub id: String,
}

struct Observer {
    id: u64,
    tx: mpsc::Sender<HubEvent>,
}

struct HubInner {
    history: History,
    observers: Vec<Observer>,
    next_observer: u64,
    accepting: bool,
}

impl HubInner {
    /// Deliver to every observer, dropping those whose sink failed
    fn broadcast(&mut self, event: HubEvent) {
        self.observers.retain(|observer| match observer.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Inspector observer {} stalled, dropping it", observer.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Inspector observer {} disconnected", observer.id);
                false
            }
        });
    }
}

/// Shared inspector state
#[derive(Clone)]
pub struct InspectorHub {
    inner: Arc<Mutex<HubInner>>,
    /// Replay hand-off to the relay session
    replay_tx: mpsc::Sender<InspectedExchange>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl InspectorHub {
    pub fn new(capacity: usize, replay_tx: mpsc::Sender<InspectedExchange>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                history: History::new(capacity),
                observers: Vec::new(),
                next_observer: 0,
                accepting: true,
            })),
            replay_tx,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Record a freshly received request
    pub async fn record_request(&self, exchange: InspectedExchange) {
        let mut inner = self.inner.lock().await;
        if let Some(evicted) = inner.history.insert(exchange.clone()) {
            debug!("Inspector history full, evicted {}", evicted.id);
        }
        inner.broadcast(HubEvent::Request { exchange });
    }

    /// Attach the outcome to a recorded request. Returns false when the
    /// exchange is no longer in the history.
    pub async fn record_response(&self, id: &str, outcome: ExchangeOutcome) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.history.get_mut(id) {
            Some(entry) => entry.outcome = Some(outcome.clone()),
            None => {
                debug!("Outcome for {} arrived after eviction", id);
                return false;
            }
        }
        inner.broadcast(HubEvent::Response { id: id.to_string(), outcome });
        true
    }

    /// Register a new observer. The first event it sees is the current
    /// history; registration happens under the same lock as broadcasts so
    /// nothing is missed or repeated. Returns `None` once the hub is closed.
    pub async fn subscribe(&self) -> Option<mpsc::Receiver<HubEvent>> {
        let mut inner = self.inner.lock().await;
        if !inner.accepting {
            return None;
        }

        let (tx, rx) = mpsc::channel(OBSERVER_BUFFER);
        let snapshot = HubEvent::Init { exchanges: inner.history.snapshot() };
        if tx.try_send(snapshot).is_err() {
            return None;
        }

        let id = inner.next_observer;
        inner.next_observer += 1;
        inner.observers.push(Observer { id, tx });
        debug!("Inspector observer {} connected ({} total)", id, inner.observers.len());
        Some(rx)
    }

    /// Current history, newest first
    pub async fn history(&self) -> Vec<InspectedExchange> {
        self.inner.lock().await.history.snapshot()
    }

    pub async fn get(&self, id: &str) -> Option<InspectedExchange> {
        self.inner.lock().await.history.get(id).cloned()
    }

    #[cfg(test)]
    pub async fn observer_count(&self) -> usize {
        self.inner.lock().await.observers.len()
    }

    /// Hand an exchange to the relay session for replay. The
    /// acknowledgement does not wait for the replay to run.
    pub async fn replay(&self, id: &str) -> Option<ReplayAck> {
        let exchange = self.get(id).await?;
        if let Err(e) = self.replay_tx.try_send(exchange) {
            warn!("Replay of {} not queued: {}", id, e);
        }
        Some(ReplayAck {
            status: "replayed",
            id: id.to_string(),
        })
    }

    /// Stop accepting observers, disconnect the current ones and stop the
    /// HTTP server. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.accepting {
            return;
        }
        inner.accepting = false;
        let observers = inner.observers.len();
        inner.observers.clear();
        self.shutdown.send_replace(true);
        info!("Inspector stopped ({} observer(s) disconnected)", observers);
    }

    #[cfg(test)]
    pub async fn is_closed(&self) -> bool {
        !self.inner.lock().await.accepting
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Inspector HTTP routes
pub fn router(hub: InspectorHub) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/events", get(sse_handler))
        .route("/replay/:id", post(replay_handler))
        .route("/api/exchanges", get(exchanges_handler))
        .with_state(hub)
}

/// Serve the inspector on 127.0.0.1 until the hub is closed
pub async fn start_inspector(hub: InspectorHub, port: u16) {
    let mut closed = hub.closed_signal();
    let app = router(hub);

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to start inspector on port {}: {}", port, e);
            return;
        }
    };
    info!("Inspector dashboard: http://localhost:{}", port);

    let shutdown = async move {
        let _ = closed.wait_for(|closed| *closed).await;
    };
    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        warn!("Inspector server error: {}", e);
    }
}

/// Serve the embedded HTML dashboard
async fn dashboard_handler() -> impl IntoResponse {
    Html(include_str!("../assets/inspector.html"))
}

/// SSE endpoint: an `init` snapshot followed by live events
async fn sse_handler(
    AxumState(hub): AxumState<InspectorHub>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, &'static str)> {
    let mut rx = hub
        .subscribe()
        .await
        .ok_or((StatusCode::SERVICE_UNAVAILABLE, "Inspector is shutting down"))?;

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => warn!("Failed to encode inspector event: {}", e),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Replay a previously recorded request
async fn replay_handler(
    AxumState(hub): AxumState<InspectorHub>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match hub.replay(&id).await {
        Some(ack) => (StatusCode::OK, Json(serde_json::json!(ack))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "exchange not found", "id": id })),
        ),
    }
}

/// All stored exchanges as JSON
async fn exchanges_handler(AxumState(hub): AxumState<InspectorHub>) -> impl IntoResponse {
    Json(hub.history().await)
}
