use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::put,
};
use axum_valid::Valid;

use crate::{
    dto::voice::VoicePresenceRequest, error::AppError, services::voice_presence_service,
    state::SharedState,
};

/// Configure the voice presence feed routes.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route(
        "/guilds/{guild}/voice/{user}",
        put(update_presence).delete(remove_presence),
    )
}

/// Report that a user joined voice or changed channel, mute or deafen state.
#[utoipa::path(
    put,
    path = "/guilds/{guild}/voice/{user}",
    tag = "voice",
    params(
        ("guild" = String, Path, description = "Guild identifier"),
        ("user" = String, Path, description = "Platform user identifier")
    ),
    request_body = VoicePresenceRequest,
    responses(
        (status = 204, description = "Presence recorded"),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Roster is fed externally")
    )
)]
pub async fn update_presence(
    State(state): State<SharedState>,
    Path((guild, user)): Path<(String, String)>,
    Valid(Json(payload)): Valid<Json<VoicePresenceRequest>>,
) -> Result<StatusCode, AppError> {
    voice_presence_service::update_presence(&state, &guild, &user, payload)?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    delete,
    path = "/guilds/{guild}/voice/{user}",
    tag = "voice",
    params(
        ("guild" = String, Path, description = "Guild identifier"),
        ("user" = String, Path, description = "Platform user identifier")
    ),
    responses(
        (status = 204, description = "Presence removed"),
        (status = 409, description = "Roster is fed externally")
    )
)]
/// Report that a user left voice.
pub async fn remove_presence(
    State(state): State<SharedState>,
    Path((guild, user)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    voice_presence_service::remove_presence(&state, &guild, &user)?;
    Ok(StatusCode::NO_CONTENT)
}
