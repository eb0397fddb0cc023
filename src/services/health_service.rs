use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Report the degraded flag, logging a failing store ping.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    if let Err(err) = state.store().health_check().await {
        warn!(error = %err, "store health check failed");
    }

    if state.is_degraded() {
        HealthResponse::degraded()
    } else {
        HealthResponse::ok()
    }
}
