//! # Timeline-rs
//!
//! Assembles the conversation timeline of a CRM ticket from bulk snapshots and
//! live deliveries.
//!
//! This server provides:
//! - Snapshot ingestion from `{ticket_id}.json` files (watched for changes)
//! - A live channel (REST or WebSocket) for single record pushes
//! - Timelines recomputed from scratch on every read and every change
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Snapshot   │────▶│ TicketCache  │◀────│  Live channel   │
//! │  watcher    │     │ (tickets.rs) │     │  (POST / WS)    │
//! └─────────────┘     └──────────────┘     └─────────────────┘
//!                            │ assemble()
//!                            ▼
//!                     ┌──────────────┐
//!                     │  Axum HTTP   │──▶ JSON / SSE / WS
//!                     └──────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/tickets` - List known tickets
//! - `GET /api/tickets/{id}/timeline` - Assembled timeline
//! - `POST /api/tickets/{id}/live` - Push one live record
//! - `DELETE /api/tickets/{id}/live` - Drop live records
//! - `GET /api/tickets/{id}/stream` - SSE timeline updates
//! - `GET /ws/tickets/{id}` - WebSocket live channel

mod cluster;
mod config;
mod error;
mod grouping;
mod identity;
mod merge;
mod participants;
mod pipeline;
mod records;
mod sequence;
mod snapshots;
mod tickets;
mod timestamp;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_stream::StreamExt;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::error::TimelineError;
use crate::records::{DateGroup, TicketId};
use crate::tickets::{LiveEvent, TicketCache, TicketEvent, TicketSummary};

/// Interval between SSE heartbeats
const HEARTBEAT_SECS: u64 = 15;

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    start_time: Instant,
    cache: Arc<TicketCache>,
    /// Monotonic id for SSE events
    seq: AtomicU64,
}

impl AppState {
    fn new(cache: Arc<TicketCache>) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            cache,
            seq: AtomicU64::new(0),
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }
}

// ============================================================================
// Health Endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    tickets: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        tickets: state.cache.ticket_count(),
    })
}

// ============================================================================
// Ticket Endpoints
// ============================================================================

#[derive(Serialize)]
struct TicketsResponse {
    tickets: Vec<TicketSummary>,
}

#[derive(Debug, Serialize)]
struct TimelineResponse {
    ticket_id: TicketId,
    groups: Vec<DateGroup>,
}

impl TimelineResponse {
    fn load(cache: &TicketCache, ticket_id: TicketId) -> Result<Self, TimelineError> {
        Ok(Self {
            ticket_id,
            groups: cache.timeline(ticket_id)?,
        })
    }
}

async fn list_tickets(State(state): State<Arc<AppState>>) -> Json<TicketsResponse> {
    Json(TicketsResponse {
        tickets: state.cache.list_tickets(),
    })
}

async fn get_timeline(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<TicketId>,
) -> Result<Json<TimelineResponse>, StatusCode> {
    Ok(Json(TimelineResponse::load(&state.cache, ticket_id)?))
}

/// Accept one live record and answer with the recomputed timeline.
async fn push_live(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<TicketId>,
    Json(event): Json<LiveEvent>,
) -> Result<Json<TimelineResponse>, StatusCode> {
    state.cache.push_live(ticket_id, event).map_err(|e| {
        warn!("Rejected live record for ticket {}: {}", ticket_id, e);
        e.status_code()
    })?;
    Ok(Json(TimelineResponse::load(&state.cache, ticket_id)?))
}

async fn clear_live(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<TicketId>,
) -> Result<StatusCode, StatusCode> {
    state.cache.clear_live(ticket_id)?;
    info!("Cleared live records for ticket {}", ticket_id);
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// SSE Timeline Stream
// ============================================================================

fn timeline_event(state: &AppState, ticket_id: TicketId) -> Result<Event, axum::Error> {
    let response = TimelineResponse::load(&state.cache, ticket_id).map_err(axum::Error::new)?;
    Event::default()
        .event("timeline")
        .id(state.next_seq().to_string())
        .json_data(response)
}

/// Wait for the next change to `ticket_id`. None once the channel closes.
async fn next_change(rx: &mut broadcast::Receiver<TicketEvent>, ticket_id: TicketId) -> Option<()> {
    loop {
        match rx.recv().await {
            Ok(event) if event.ticket_id() == ticket_id => return Some(()),
            Ok(_) => continue,
            // Missed events are irrelevant: the next read recomputes everything
            Err(RecvError::Lagged(n)) => {
                debug!("Timeline subscriber for ticket {} lagged by {}", ticket_id, n);
                return Some(());
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn stream_timeline(
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<TicketId>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    if !state.cache.contains(ticket_id) {
        return Err(StatusCode::NOT_FOUND);
    }

    let rx = state.cache.subscribe();

    let heartbeat_state = state.clone();
    let heartbeat = stream::unfold((), move |()| {
        let s = heartbeat_state.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(HEARTBEAT_SECS)).await;
            let event = Event::default()
                .event("heartbeat")
                .id(s.next_seq().to_string())
                .data(chrono::Utc::now().timestamp_millis().to_string());
            Some((Ok::<_, axum::Error>(event), ()))
        }
    });

    let update_state = state.clone();
    let updates = stream::unfold(rx, move |mut rx| {
        let s = update_state.clone();
        async move {
            next_change(&mut rx, ticket_id).await?;
            Some((timeline_event(&s, ticket_id), rx))
        }
    });

    let initial = stream::once({
        let s = state.clone();
        async move { timeline_event(&s, ticket_id) }
    });

    let merged = initial.chain(StreamExt::merge(heartbeat, updates));
    Ok(Sse::new(merged).keep_alive(KeepAlive::default()))
}

// ============================================================================
// Live Channel WebSocket
// ============================================================================

#[derive(Serialize)]
struct WsError {
    error: String,
}

async fn ticket_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(ticket_id): Path<TicketId>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ticket_ws(socket, state, ticket_id))
}

fn ws_json<T: Serialize>(value: &T) -> Option<Message> {
    match serde_json::to_string(value) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            error!("Failed to serialize websocket frame: {}", e);
            None
        }
    }
}

fn ws_timeline(state: &AppState, ticket_id: TicketId) -> Option<Message> {
    match TimelineResponse::load(&state.cache, ticket_id) {
        Ok(response) => ws_json(&response),
        Err(TimelineError::UnknownTicket(_)) => None,
        Err(e) => ws_json(&WsError { error: e.to_string() }),
    }
}

/// Apply one inbound live frame. Returns the error frame to send back when
/// the frame is rejected.
fn apply_live_frame(cache: &TicketCache, ticket_id: TicketId, text: &str) -> Option<Message> {
    let outcome = serde_json::from_str::<LiveEvent>(text)
        .map_err(TimelineError::from)
        .and_then(|event| cache.push_live(ticket_id, event));
    match outcome {
        Ok(()) => None,
        Err(e) => {
            warn!("Rejected live frame for ticket {}: {}", ticket_id, e);
            ws_json(&WsError { error: e.to_string() })
        }
    }
}

async fn handle_ticket_ws(mut socket: WebSocket, state: Arc<AppState>, ticket_id: TicketId) {
    info!("Live channel opened for ticket {}", ticket_id);
    let mut rx = state.cache.subscribe();

    if let Some(frame) = ws_timeline(&state, ticket_id) {
        if socket.send(frame).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            // Recompute and push after every change to this ticket
            change = next_change(&mut rx, ticket_id) => {
                if change.is_none() {
                    break;
                }
                if let Some(frame) = ws_timeline(&state, ticket_id) {
                    if socket.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Live channel error for ticket {}: {}", ticket_id, e);
                        break;
                    }
                    _ => continue,
                };

                if let Some(frame) = apply_live_frame(&state.cache, ticket_id, &text) {
                    if socket.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    info!("Live channel closed for ticket {}", ticket_id);
}

// ============================================================================
// Router
// ============================================================================

fn router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    Router::new()
        // Health
        .route("/health", get(health))
        // Tickets
        .route("/api/tickets", get(list_tickets))
        .route("/api/tickets/{ticket_id}/timeline", get(get_timeline))
        .route("/api/tickets/{ticket_id}/live", post(push_live).delete(clear_live))
        .route("/api/tickets/{ticket_id}/stream", get(stream_timeline))
        // Live channel
        .route("/ws/tickets/{ticket_id}", get(ticket_ws))
        // Static files
        .fallback_service(ServeDir::new(&config.static_dir).append_index_html_on_directories(true))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("timeline_rs=info,tower_http=info")
            }),
        )
        .init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let cache = TicketCache::new(config.assemble_options());
    let state = AppState::new(cache.clone());

    // Snapshot watcher
    tokio::spawn(snapshots::start(cache, config.snapshot_dir.clone()));

    let app = router(state, &config);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Timeline-rs v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AssembleOptions;
    use crate::tickets::Snapshot;
    use axum::body::{to_bytes, Body, BodyDataStream};
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<TicketCache>) {
        let cache = TicketCache::new(AssembleOptions::default());
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        (router(AppState::new(cache.clone()), &config), cache)
    }

    async fn send(
        app: Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let (status, body) = send(app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tickets"], 0);
    }

    #[tokio::test]
    async fn test_unknown_ticket_is_404() {
        let (app, _) = test_app();
        let (status, _) = send(app.clone(), Method::GET, "/api/tickets/5/timeline", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(app, Method::GET, "/api/tickets/5/stream", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_snapshot_timeline_shape() {
        let (app, cache) = test_app();
        let snapshot: Snapshot = Snapshot {
            messages: serde_json::from_value(json!([
                {
                    "message_id": "m1",
                    "ticket_id": 8,
                    "time_sent": "01-03-2024 09:00:00",
                    "message": "hi"
                }
            ]))
            .unwrap(),
            logs: serde_json::from_value(json!([
                {
                    "id": 2,
                    "ticket_id": 8,
                    "timestamp": "2024-03-01T09:01:00Z",
                    "subject": "assigned"
                }
            ]))
            .unwrap(),
            ..Snapshot::default()
        };
        let generation = cache.begin_snapshot(8);
        assert!(cache.apply_snapshot(8, generation, snapshot));

        let (status, body) = send(app, Method::GET, "/api/tickets/8/timeline", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ticket_id"], 8);
        let group = &body["groups"][0];
        assert_eq!(group["date"], "01.03.2024");
        assert_eq!(group["blocks"][0]["type"], "dialog");
        assert_eq!(group["blocks"][0]["items"][0]["itemType"], "message");
        assert_eq!(group["blocks"][0]["items"][0]["isLive"], false);
        assert_eq!(group["blocks"][1]["type"], "log_cluster");
    }

    #[tokio::test]
    async fn test_push_live_then_clear() {
        let (app, _) = test_app();
        let event = json!({
            "kind": "message",
            "message_id": "live-1",
            "ticket_id": 3,
            "time_sent": "01-03-2024 10:00:00"
        });
        let (status, body) =
            send(app.clone(), Method::POST, "/api/tickets/3/live", Some(event)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["groups"][0]["blocks"][0]["items"][0]["key"], "live-1");
        assert_eq!(body["groups"][0]["blocks"][0]["items"][0]["isLive"], true);

        let (status, _) = send(app.clone(), Method::DELETE, "/api/tickets/3/live", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(app, Method::GET, "/api/tickets/3/timeline", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["groups"], json!([]));
    }

    #[tokio::test]
    async fn test_push_live_for_other_ticket_is_rejected() {
        let (app, _) = test_app();
        let event = json!({"kind": "log", "id": 1, "ticket_id": 4, "timestamp": 0, "subject": "x"});
        let (status, _) = send(app, Method::POST, "/api/tickets/3/live", Some(event)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_tickets() {
        let (app, cache) = test_app();
        let note: LiveEvent = serde_json::from_value(json!({
            "kind": "note", "ticket_id": 11, "technician_id": 1, "value": "x", "created_at": ""
        }))
        .unwrap();
        cache.push_live(11, note).unwrap();

        let (status, body) = send(app, Method::GET, "/api/tickets", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tickets"][0]["ticket_id"], 11);
        assert_eq!(body["tickets"][0]["live_events"], 1);
    }

    fn live_message(ticket_id: TicketId, message_id: &str) -> LiveEvent {
        serde_json::from_value(json!({
            "kind": "message",
            "message_id": message_id,
            "ticket_id": ticket_id,
            "time_sent": "01-03-2024 10:00:00"
        }))
        .unwrap()
    }

    fn frame_json(frame: Option<Message>) -> Value {
        match frame {
            Some(Message::Text(text)) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    async fn next_frame(body: &mut BodyDataStream) -> String {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("no SSE frame within 5s")
            .unwrap()
            .unwrap();
        String::from_utf8(chunk.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_stream_sends_initial_then_recomputed_timeline() {
        let (app, cache) = test_app();
        cache.push_live(8, live_message(8, "first")).unwrap();

        let request = Request::get("/api/tickets/8/stream").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut body = response.into_body().into_data_stream();
        let initial = next_frame(&mut body).await;
        assert!(initial.contains("event: timeline"));
        assert!(initial.contains(r#""key":"first""#));
        assert!(!initial.contains(r#""key":"second""#));

        cache.push_live(8, live_message(8, "second")).unwrap();
        let update = next_frame(&mut body).await;
        assert!(update.contains("event: timeline"));
        assert!(update.contains(r#""key":"first""#));
        assert!(update.contains(r#""key":"second""#));
    }

    #[tokio::test]
    async fn test_next_change_filters_by_ticket() {
        let cache = TicketCache::new(AssembleOptions::default());
        let mut rx = cache.subscribe();

        cache.push_live(1, live_message(1, "elsewhere")).unwrap();
        cache.push_live(2, live_message(2, "here")).unwrap();
        assert_eq!(next_change(&mut rx, 2).await, Some(()));

        drop(cache);
        assert_eq!(next_change(&mut rx, 2).await, None);
    }

    #[test]
    fn test_live_frame_for_other_ticket_gets_error_frame() {
        let cache = TicketCache::new(AssembleOptions::default());
        let foreign = json!({
            "kind": "message",
            "message_id": "x",
            "ticket_id": 4,
            "time_sent": ""
        });

        let reply = frame_json(apply_live_frame(&cache, 3, &foreign.to_string()));
        assert_eq!(reply["error"], "record belongs to ticket 4, expected 3");

        let reply = frame_json(apply_live_frame(&cache, 3, "{not json"));
        assert!(reply["error"].as_str().unwrap().starts_with("invalid json"));
        assert!(!cache.contains(3));

        let accepted = json!({
            "kind": "log",
            "id": 9,
            "ticket_id": 3,
            "timestamp": 1709287200000i64,
            "subject": "assigned"
        });
        assert!(apply_live_frame(&cache, 3, &accepted.to_string()).is_none());
        assert!(cache.contains(3));
    }

    #[test]
    fn test_ws_timeline_frame() {
        let cache = TicketCache::new(AssembleOptions::default());
        let state = AppState::new(cache.clone());
        assert!(ws_timeline(&state, 5).is_none());

        cache.push_live(5, live_message(5, "m")).unwrap();
        let frame = frame_json(ws_timeline(&state, 5));
        assert_eq!(frame["ticket_id"], 5);
        assert_eq!(frame["groups"][0]["date"], "01.03.2024");
        assert_eq!(frame["groups"][0]["blocks"][0]["items"][0]["key"], "m");
    }
}
