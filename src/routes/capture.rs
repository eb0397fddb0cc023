use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};

use crate::{services::capture_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/capture",
    tag = "capture",
    responses((status = 101, description = "Switching protocols to WebSocket"))
)]
/// Upgrade the HTTP connection into a capture client WebSocket session.
pub async fn capture_handler(
    State(state): State<SharedState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| capture_service::handle_socket(state, socket))
}

/// Configure the capture WebSocket endpoint.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/capture", get(capture_handler))
}
