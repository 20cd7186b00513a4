//! HTTP surface for the event hub.
//!
//! Three endpoints behind one axum router:
//!
//! - `POST /events` — single-event JSON ingest for out-of-process producers.
//!   Malformed bodies get a client error and are dropped; they never reach
//!   subscribers or crash the process.
//! - `GET /events/stream` — long-lived SSE subscription. Optional
//!   `session_id` / `since_seq` query parameters request buffered replay
//!   before live tailing; the SSE event name is the envelope `type`.
//!   Replay and live tail may overlap — subscribers de-duplicate by `seq`.
//! - `GET /health` — liveness probe.
//! - `GET /status` — per-category admission counters.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::hub::EventHub;
use crate::models::event::{EventEnvelope, RawEvent};
use crate::scheduler::admission::{AdmissionController, CategoryStatus};
use crate::{AppError, Result};

/// Shared state for the HTTP handlers.
pub struct HttpContext {
    /// Event hub receiving ingested events and serving subscriptions.
    pub hub: Arc<EventHub>,
    /// Admission controller backing `GET /status`; absent when the binary
    /// serves the hub without a scheduled run.
    pub admission: Option<Arc<AdmissionController>>,
}

/// Handler for `GET /health` — returns 200 OK with a plain-text body.
async fn health() -> &'static str {
    "ok"
}

/// Handler for `POST /events`.
///
/// Accepts one JSON event per request. Schema violations are rejected with
/// 422; the axum `Json` extractor already rejects non-JSON bodies before
/// this handler runs.
async fn ingest_event(
    State(ctx): State<Arc<HttpContext>>,
    Json(raw): Json<RawEvent>,
) -> std::result::Result<(StatusCode, Json<EventEnvelope>), (StatusCode, String)> {
    match ctx.hub.ingest(raw) {
        Ok(envelope) => Ok((StatusCode::ACCEPTED, Json(envelope))),
        Err(err) => {
            warn!(%err, "rejected ingest payload");
            Err((StatusCode::UNPROCESSABLE_ENTITY, err.to_string()))
        }
    }
}

/// Handler for `GET /status` — per-category admission counters.
async fn status(State(ctx): State<Arc<HttpContext>>) -> Json<Vec<CategoryStatus>> {
    Json(
        ctx.admission
            .as_ref()
            .map(|admission| admission.status())
            .unwrap_or_default(),
    )
}

/// Query parameters for `GET /events/stream`.
#[derive(Debug, Deserialize)]
struct StreamParams {
    /// Restrict the stream to one session and enable replay.
    session_id: Option<String>,
    /// Replay buffered events with `seq` greater than this before tailing.
    #[serde(default)]
    since_seq: u64,
}

/// Render one envelope as an SSE message named after its `type`.
fn to_sse(envelope: &EventEnvelope) -> std::result::Result<SseEvent, Infallible> {
    let event = SseEvent::default().event(envelope.kind.type_name());
    Ok(match event.json_data(envelope) {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "failed to serialize envelope for SSE");
            SseEvent::default().event("error").data("serialization failure")
        }
    })
}

/// Handler for `GET /events/stream`.
///
/// Subscribes before snapshotting history so no event falls between replay
/// and live tail. A subscriber that lags past the broadcast capacity is
/// disconnected (its stream ends) and must re-subscribe with replay.
async fn stream_events(
    State(ctx): State<Arc<HttpContext>>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>> {
    let rx = ctx.hub.subscribe();

    let replay: Vec<EventEnvelope> = params
        .session_id
        .as_deref()
        .map(|session_id| ctx.hub.history(session_id, params.since_seq))
        .unwrap_or_default();

    let session_filter = params.session_id;
    let replay_stream = stream::iter(replay).map(|envelope| to_sse(&envelope));

    let live_stream = stream::unfold((rx, session_filter), |(mut rx, filter)| async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if filter
                        .as_deref()
                        .is_some_and(|session| session != envelope.session_id)
                    {
                        continue;
                    }
                    return Some((to_sse(&envelope), (rx, filter)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged; disconnecting");
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(replay_stream.chain(live_stream)).keep_alive(KeepAlive::default())
}

/// Build the hub router.
#[must_use]
pub fn router(ctx: Arc<HttpContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events", post(ingest_event))
        .route("/events/stream", get(stream_events))
        .route("/status", get(status))
        .with_state(ctx)
}

/// Serve the hub endpoints on `127.0.0.1:port` until the token fires.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener fails to bind, or
/// `AppError::Io` if the server errors while running.
pub async fn serve_http(ctx: Arc<HttpContext>, port: u16, ct: CancellationToken) -> Result<()> {
    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind hub endpoints on {bind}: {err}")))?;

    info!(%bind, "starting hub HTTP endpoints");

    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("hub HTTP server error: {err}")))?;

    info!("hub HTTP endpoints shut down");
    Ok(())
}
