// Axum dashboard surface: exposes session views, segment playback and proctor actions over loopback HTTP.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::engine::coordinator::Coordinator;
use crate::engine::playlist::{Direction, Playback};
use crate::engine::session::SessionStatus;
use crate::error::ProctorError;

type AppState = Arc<Coordinator>;

pub struct DashboardServer {
    port: u16,
    coordinator: Arc<Coordinator>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl DashboardServer {
    /// Serve the dashboard on loopback. Port 0 picks a free one.
    pub async fn start(coordinator: Arc<Coordinator>, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        let app = router(coordinator.clone());
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        info!("dashboard listening on 127.0.0.1:{}", port);

        Ok(Self {
            port,
            coordinator,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn url_for_session(&self, session_id: &str) -> String {
        format!("{}/sessions/{}", self.base_url(), session_id)
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/sessions", get(list_handler))
        .route(
            "/sessions/{session_id}",
            get(view_handler).put(watch_handler).delete(unwatch_handler),
        )
        .route("/sessions/{session_id}/status", put(status_handler))
        .route("/sessions/{session_id}/segment", get(segment_handler))
        .route("/sessions/{session_id}/advance", post(advance_handler))
        .route("/sessions/{session_id}/live", post(live_handler))
        .route("/sessions/{session_id}/seek", post(seek_handler))
        .route("/sessions/{session_id}/ended", post(ended_handler))
        .route("/sessions/{session_id}/progress", post(progress_handler))
        .route("/sessions/{session_id}/messages", post(message_handler))
        .route("/sessions/{session_id}/terminate", post(terminate_handler))
        .route(
            "/sessions/{session_id}/chat",
            post(open_chat_handler).delete(close_chat_handler),
        )
        .with_state(coordinator)
}

#[derive(Deserialize)]
struct StatusBody {
    status: SessionStatus,
}

#[derive(Deserialize)]
struct AdvanceBody {
    direction: Direction,
}

#[derive(Deserialize)]
struct SeekBody {
    index: usize,
}

#[derive(Deserialize)]
struct ProgressBody {
    offset_secs: f64,
}

#[derive(Deserialize)]
struct MessageBody {
    body: String,
}

#[derive(Deserialize)]
struct TerminateBody {
    confirmation: String,
}

/// Map a classified failure onto an HTTP status.
fn error_response(err: anyhow::Error) -> Response {
    let status = match ProctorError::classify(&err) {
        Some(ProctorError::UnknownSession(_)) => StatusCode::NOT_FOUND,
        Some(ProctorError::ConfirmationMismatch) => StatusCode::BAD_REQUEST,
        Some(ProctorError::AuthRejected(_)) | Some(ProctorError::NetworkFailure(_)) => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("dashboard request failed: {:#}", err);
    } else {
        debug!("dashboard request rejected: {:#}", err);
    }
    (status, format!("error: {:#}", err)).into_response()
}

fn view_response(coordinator: &Coordinator, session_id: &str) -> Response {
    match coordinator.view(session_id) {
        Ok(view) => Json(view).into_response(),
        Err(e) => error_response(e),
    }
}

fn content_type_for(url: &str) -> &'static str {
    let path = url.split('?').next().unwrap_or(url);
    if path.ends_with(".mp4") {
        "video/mp4"
    } else {
        "video/webm"
    }
}

fn playback_response(playback: Playback) -> Response {
    let segment = playback.segment;
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for(&segment.url).to_string()),
            (
                HeaderName::from_static("x-segment-index"),
                segment.sequence_index.to_string(),
            ),
            (
                HeaderName::from_static("x-captured-at"),
                segment.captured_at.to_string(),
            ),
        ],
        playback.blob,
    )
        .into_response()
}

/// GET /stats
async fn stats_handler(State(coordinator): State<AppState>) -> Response {
    Json(coordinator.stats()).into_response()
}

/// GET /sessions: every watched session's view.
async fn list_handler(State(coordinator): State<AppState>) -> Response {
    Json(coordinator.views()).into_response()
}

async fn view_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    view_response(&coordinator, &session_id)
}

/// PUT /sessions/{session_id}: start watching; 201 when new.
async fn watch_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    let created = coordinator.watch(&session_id, SessionStatus::Started);
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    match coordinator.view(&session_id) {
        Ok(view) => (status, Json(view)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn unwatch_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    if coordinator.unwatch(&session_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(ProctorError::UnknownSession(session_id).into())
    }
}

async fn status_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<StatusBody>,
) -> Response {
    match coordinator.set_status(&session_id, body.status) {
        Ok(()) => view_response(&coordinator, &session_id),
        Err(e) => error_response(e),
    }
}

/// GET /sessions/{session_id}/segment: blob under the cursor, fetched on demand.
async fn segment_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match coordinator.current_playback(&session_id).await {
        Ok(Some(playback)) => playback_response(playback),
        Ok(None) => (StatusCode::NOT_FOUND, "no segment available").into_response(),
        Err(e) => error_response(e),
    }
}

async fn advance_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<AdvanceBody>,
) -> Response {
    match coordinator.advance(&session_id, body.direction) {
        Ok(_) => view_response(&coordinator, &session_id),
        Err(e) => error_response(e),
    }
}

async fn live_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match coordinator.jump_to_live(&session_id) {
        Ok(_) => view_response(&coordinator, &session_id),
        Err(e) => error_response(e),
    }
}

async fn seek_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SeekBody>,
) -> Response {
    match coordinator.seek(&session_id, body.index) {
        Ok(_) => view_response(&coordinator, &session_id),
        Err(e) => error_response(e),
    }
}

/// POST /sessions/{session_id}/ended: the player finished a segment; 204 when already live.
async fn ended_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match coordinator.segment_ended(&session_id).await {
        Ok(Some(playback)) => playback_response(playback),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn progress_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ProgressBody>,
) -> Response {
    match coordinator.set_playback_offset(&session_id, body.offset_secs) {
        Ok(()) => view_response(&coordinator, &session_id),
        Err(e) => error_response(e),
    }
}

async fn message_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<MessageBody>,
) -> Response {
    if body.body.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "message body is empty").into_response();
    }
    match coordinator.send_message(&session_id, &body.body).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn terminate_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<TerminateBody>,
) -> Response {
    match coordinator.terminate(&session_id, &body.confirmation).await {
        Ok(()) => view_response(&coordinator, &session_id),
        Err(e) => error_response(e),
    }
}

async fn open_chat_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match coordinator.open_chat(&session_id) {
        Ok(()) => view_response(&coordinator, &session_id),
        Err(e) => error_response(e),
    }
}

async fn close_chat_handler(
    State(coordinator): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    match coordinator.close_chat(&session_id) {
        Ok(_) => view_response(&coordinator, &session_id),
        Err(e) => error_response(e),
    }
}
