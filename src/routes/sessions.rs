use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dto::session::{
        SessionActionResponse, SessionSummary, StartSessionRequest, StartSessionResponse,
    },
    error::AppError,
    services::session_service,
    state::SharedState,
};

/// Configure the session administration routes.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new()
        .route("/sessions", post(start_session))
        .route("/sessions/{code}", get(get_session).delete(end_session))
        .route("/sessions/{code}/pause", post(pause_session))
        .route("/sessions/{code}/resume", post(resume_session))
        .route("/sessions/{code}/refresh", post(refresh_session))
}

/// Start a session bound to a text and voice channel.
///
/// Any session already bound to one of those channels is ended first.
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 200, description = "Session started", body = StartSessionResponse),
        (status = 400, description = "Invalid request"),
        (status = 503, description = "Shared store unavailable")
    )
)]
pub async fn start_session(
    State(state): State<SharedState>,
    Valid(Json(payload)): Valid<Json<StartSessionRequest>>,
) -> Result<Json<StartSessionResponse>, AppError> {
    Ok(Json(session_service::start_session(&state, payload).await?))
}

#[utoipa::path(
    get,
    path = "/sessions/{code}",
    tag = "sessions",
    params(("code" = String, Path, description = "Connect code of the session")),
    responses(
        (status = 200, description = "Session snapshot", body = SessionSummary),
        (status = 404, description = "Unknown connect code")
    )
)]
/// Read the current state of a session.
pub async fn get_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    Ok(Json(session_service::summary(&state, &code).await?))
}

/// End a session, restoring the voice state of its members.
#[utoipa::path(
    delete,
    path = "/sessions/{code}",
    tag = "sessions",
    params(("code" = String, Path, description = "Connect code of the session")),
    responses(
        (status = 200, description = "Session ended", body = SessionActionResponse),
        (status = 404, description = "Unknown connect code")
    )
)]
pub async fn end_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<SessionActionResponse>, AppError> {
    Ok(Json(session_service::end_session(&state, &code).await?))
}

/// Stop enforcing voice rules and un-mute every tracked member.
#[utoipa::path(
    post,
    path = "/sessions/{code}/pause",
    tag = "sessions",
    params(("code" = String, Path, description = "Connect code of the session")),
    responses((status = 200, description = "Enforcement paused", body = SessionActionResponse))
)]
pub async fn pause_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<SessionActionResponse>, AppError> {
    Ok(Json(session_service::set_running(&state, &code, false).await?))
}

/// Re-enable voice rules for the current phase.
#[utoipa::path(
    post,
    path = "/sessions/{code}/resume",
    tag = "sessions",
    params(("code" = String, Path, description = "Connect code of the session")),
    responses((status = 200, description = "Enforcement resumed", body = SessionActionResponse))
)]
pub async fn resume_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<SessionActionResponse>, AppError> {
    Ok(Json(session_service::set_running(&state, &code, true).await?))
}

#[utoipa::path(
    post,
    path = "/sessions/{code}/refresh",
    tag = "sessions",
    params(("code" = String, Path, description = "Connect code of the session")),
    responses((status = 200, description = "Snapshot re-published", body = SessionActionResponse))
)]
/// Re-publish the session snapshot on the SSE stream.
pub async fn refresh_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<SessionActionResponse>, AppError> {
    Ok(Json(session_service::refresh(&state, &code).await?))
}
