use axum::Router;

use crate::state::SharedState;

pub mod capture;
pub mod docs;
pub mod health;
pub mod sessions;
pub mod sse;
pub mod voice;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    let api_router = health::router()
        .merge(sse::router())
        .merge(capture::router())
        .merge(sessions::router())
        .merge(voice::router());

    let docs_router = docs::router(state.clone());

    api_router.merge(docs_router).with_state(state)
}
