use std::convert::Infallible;

use axum::{
    Router,
    extract::State,
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;
use tracing::info;

use crate::{services::sse_service, state::SharedState};

#[utoipa::path(
    get,
    path = "/sse/sessions",
    tag = "sse",
    responses((status = 200, description = "Session SSE stream", content_type = "text/event-stream", body = String))
)]
/// Stream session snapshots, match results and degraded mode changes.
pub async fn sessions_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.events().subscribe();
    info!("New session SSE connection");
    state.events().broadcast_status(state.is_degraded());
    sse_service::to_sse_stream(receiver)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sse/sessions", get(sessions_stream))
}
