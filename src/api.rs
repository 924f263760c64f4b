//! REST endpoints and the notice WebSocket.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{EngagementEvent, Engine};
use crate::error::{ContactStoreError, DatabaseError, EnrollmentError, Error};
use crate::rate_limit::RateLimitConfig;
use crate::sequence::SequenceSpec;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Build the router for the engine's HTTP surface.
pub fn routes(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/notices", get(ws_handler))
        .route("/api/sequences", post(create_sequence))
        .route(
            "/api/sequences/{id}",
            get(get_sequence).put(update_sequence),
        )
        .route("/api/sequences/{id}/enroll", post(enroll))
        .route("/api/sequences/{id}/pause", post(pause))
        .route("/api/sequences/{id}/resume", post(resume))
        .route("/api/sequences/{id}/flagged", get(list_flagged))
        .route(
            "/api/enrollments/{id}",
            get(get_enrollment).delete(unenroll),
        )
        .route(
            "/api/contacts/{id}/enrollments",
            axum::routing::delete(remove_contact),
        )
        .route("/api/events", post(ingest_event))
        .route(
            "/api/senders/{id}/limits",
            get(get_limits).put(set_limits),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(AppState { engine })
}

// ── Errors ──────────────────────────────────────────────────────────────

/// Error rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct AppError(pub Error);

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Enrollment(EnrollmentError::NotFound { .. })
            | Error::Enrollment(EnrollmentError::SequenceNotFound { .. })
            | Error::ContactStore(ContactStoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Enrollment(EnrollmentError::InvalidTransition { .. })
            | Error::Enrollment(EnrollmentError::InvalidSequenceStatus { .. })
            | Error::Database(DatabaseError::Constraint(_)) => StatusCode::CONFLICT,
            Error::ContactStore(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, AppError>;

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "outreach-engine"
    }))
}

// ── Sequences ───────────────────────────────────────────────────────────

async fn create_sequence(
    State(state): State<AppState>,
    Json(spec): Json<SequenceSpec>,
) -> ApiResult<impl IntoResponse> {
    let sequence = state.engine.create_sequence(spec, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(sequence)))
}

async fn get_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_sequence(id).await?))
}

async fn update_sequence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(spec): Json<SequenceSpec>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.update_sequence(id, spec, Utc::now()).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnrollRequest {
    contact_ids: Vec<String>,
}

async fn enroll(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<EnrollRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .engine
        .enroll(id, &body.contact_ids, Utc::now())
        .await?;
    Ok(Json(outcome))
}

async fn pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.pause(id, Utc::now()).await?))
}

async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.resume(id, Utc::now()).await?))
}

async fn list_flagged(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_flagged(id).await?))
}

// ── Enrollments ─────────────────────────────────────────────────────────

async fn get_enrollment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_enrollment_status(id).await?))
}

async fn unenroll(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.unenroll(id, Utc::now()).await?))
}

async fn remove_contact(
    State(state): State<AppState>,
    Path(contact_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let removed = state
        .engine
        .remove_contact(&contact_id, Utc::now())
        .await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn ingest_event(
    State(state): State<AppState>,
    Json(event): Json<EngagementEvent>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.ingest_event(event, Utc::now()).await?))
}

// ── Sender limits ───────────────────────────────────────────────────────

async fn get_limits(
    State(state): State<AppState>,
    Path(sender_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_rate_limits(&sender_id).await?))
}

async fn set_limits(
    State(state): State<AppState>,
    Path(sender_id): Path<String>,
    Json(config): Json<RateLimitConfig>,
) -> ApiResult<impl IntoResponse> {
    let rescheduled = state
        .engine
        .set_rate_limits(&sender_id, config.clone(), Utc::now())
        .await?;
    Ok(Json(serde_json::json!({
        "limits": config,
        "rescheduled": rescheduled,
    })))
}

// ── Notices WebSocket ───────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NoticeFilter {
    sequence_id: Option<Uuid>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<NoticeFilter>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!(sequence_id = ?filter.sequence_id, "Notice WebSocket client connecting");
    let rx = state.engine.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx, filter.sequence_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    mut rx: broadcast::Receiver<crate::scheduler::EngineNotice>,
    sequence_id: Option<Uuid>,
) {
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(notice) => {
                        if sequence_id.is_some_and(|id| id != notice.sequence_id()) {
                            continue;
                        }
                        let Ok(json) = serde_json::to_string(&notice) else {
                            continue;
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Notice WS client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Notice WS client lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("Notice WebSocket closed");
}
