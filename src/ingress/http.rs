//! HTTP ingress (§6): `POST /mcp` carries a JSON-RPC 2.0 body (single
//! object or batch array); the response is `application/json`, or a 204
//! with no body for a lone notification, or — when the request lands on a
//! streaming-capable backend — a `text/event-stream` of response chunks.
//! `GET /mcp` opens a separate `text/event-stream` carrying server-initiated
//! notifications (today: `notifications/tools/listChanged`). `GET
//! /mcp/stream/{id}` resumes a response stream from `Last-Event-ID`, per
//! §4.4.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router as AxumRouter;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use dashmap::DashMap;
use futures_util::Stream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use super::{HttpOutcome, Ingress};
use crate::transport::sse::{RetentionWindow, SseEvent};

/// How many chunks of a finished (or still-open) response stream stay
/// replayable for a `Last-Event-ID` reconnect.
const STREAM_RETENTION: usize = 256;
/// How long a stream session survives after its chunk stream ends, in case
/// a client reconnects to pick up a tail it already has buffered.
const STREAM_GRACE: Duration = Duration::from_secs(30);

static STREAM_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct AppState {
    ingress: Arc<Ingress>,
    streams: Arc<DashMap<String, Arc<StreamSession>>>,
}

/// One live-or-recently-finished response stream: a bounded replay window
/// for reconnecting clients, plus a broadcast channel live subscribers read
/// from.
struct StreamSession {
    window: Mutex<RetentionWindow>,
    sender: broadcast::Sender<SseFrame>,
}

/// An owned, `Clone`-able SSE frame, since [`broadcast::Sender`] requires
/// its payload to be cloned once per subscriber.
#[derive(Clone)]
struct SseFrame {
    id: String,
    data: String,
}

impl From<SseFrame> for Event {
    fn from(frame: SseFrame) -> Self {
        Event::default().id(frame.id).data(frame.data)
    }
}

pub async fn serve(ingress: Arc<Ingress>, listen: &str, shutdown: Arc<Notify>) -> anyhow::Result<()> {
    let state = AppState { ingress, streams: Arc::new(DashMap::new()) };
    let app = AxumRouter::new()
        .route("/mcp", get(get_mcp).post(post_mcp))
        .route("/mcp/stream/{id}", get(get_stream))
        .with_state(state);

    let listener = TcpListener::bind(listen).await?;
    info!(listen = %listen, "http ingress listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;
    info!("http ingress stopped");
    Ok(())
}

async fn post_mcp(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    match state.ingress.handle_http(payload).await {
        Some(HttpOutcome::Json(response)) => Json(response).into_response(),
        // A lone notification (or a batch made entirely of notifications)
        // produces no response body (§8's boundary-behavior table).
        None => StatusCode::NO_CONTENT.into_response(),
        Some(HttpOutcome::Stream { backend_id, stream, .. }) => {
            let stream_id = format!("{backend_id}-{}", STREAM_COUNTER.fetch_add(1, Ordering::Relaxed));
            let session = Arc::new(StreamSession {
                window: Mutex::new(RetentionWindow::new(STREAM_RETENTION)),
                sender: broadcast::channel(STREAM_RETENTION).0,
            });
            state.streams.insert(stream_id.clone(), Arc::clone(&session));
            let live = session.sender.subscribe();
            tokio::spawn(forward_stream(Arc::clone(&state.streams), stream_id.clone(), stream));

            let sse_stream = BroadcastStream::new(live)
                .filter_map(|msg| async move { msg.ok().map(|frame| Ok::<Event, Infallible>(frame.into())) });
            let mut response = Sse::new(sse_stream).into_response();
            if let Ok(value) = stream_id.parse() {
                response.headers_mut().insert("x-stream-id", value);
            }
            response
        }
    }
}

/// Drains `stream`'s chunks into `session`'s retention window and broadcast
/// channel, assigning each a monotonic event id so reconnecting clients can
/// resume via `Last-Event-ID`. Keeps the session registered for
/// [`STREAM_GRACE`] after the backend's last chunk so a client that
/// disconnected right at the end can still fetch it.
async fn forward_stream(
    streams: Arc<DashMap<String, Arc<StreamSession>>>,
    stream_id: String,
    mut stream: crate::transport::ChunkStream,
) {
    let Some(session) = streams.get(&stream_id).map(|e| Arc::clone(e.value())) else { return };
    let mut next_id: u64 = 1;
    while let Some(item) = stream.next().await {
        let data = match item {
            Ok(v) => v.to_string(),
            Err(e) => serde_json::json!({"error": e.to_string()}).to_string(),
        };
        let event_id = next_id.to_string();
        next_id += 1;
        session.window.lock().await.push(SseEvent { id: Some(event_id.clone()), event: None, data: data.clone() });
        let _ = session.sender.send(SseFrame { id: event_id, data });
    }
    tokio::time::sleep(STREAM_GRACE).await;
    streams.remove(&stream_id);
}

/// Resumes (or joins live) a response stream opened by a prior `POST /mcp`.
/// A `Last-Event-ID` header replays everything after that id from the
/// retention window before switching to live broadcast delivery; an id that
/// has aged out of the window yields 410 Gone rather than silently skipping
/// events, since the client can't tell the difference from here.
async fn get_stream(State(state): State<AppState>, Path(stream_id): Path<String>, headers: HeaderMap) -> Response {
    let Some(session) = state.streams.get(&stream_id).map(|e| Arc::clone(e.value())) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let last_event_id = headers.get("last-event-id").and_then(|v| v.to_str().ok()).map(str::to_string);

    let replay: Vec<Event> = match last_event_id {
        Some(id) => {
            let window = session.window.lock().await;
            match window.replay_after(&id) {
                Some(events) => events
                    .into_iter()
                    .map(|e| {
                        let mut ev = Event::default().data(e.data);
                        if let Some(id) = e.id {
                            ev = ev.id(id);
                        }
                        ev
                    })
                    .collect(),
                None => return StatusCode::GONE.into_response(),
            }
        }
        None => Vec::new(),
    };

    let live = session.sender.subscribe();
    let live_stream = BroadcastStream::new(live)
        .filter_map(|msg| async move { msg.ok().map(|frame| Ok::<Event, Infallible>(frame.into())) });
    let combined = futures_util::stream::iter(replay.into_iter().map(Ok::<Event, Infallible>)).chain(live_stream);
    Sse::new(combined).into_response()
}

/// Opens the server-to-client notification stream. `Last-Event-ID`-based
/// resumption is not implemented here: notifications carry no durable log
/// today, so a reconnecting client simply misses events sent while
/// disconnected (it will still see a consistent state on its next
/// `tools/list` call, since that result is generation-keyed rather than
/// notification-keyed). Response streams opened via `POST /mcp` are a
/// separate, resumable mechanism; see `get_stream`.
async fn get_mcp(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.ingress.change_notifications.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|msg| async move {
        match msg {
            Ok(value) => Some(Ok(Event::default().data(value.to_string()))),
            Err(_) => None,
        }
    });
    Sse::new(stream)
}
