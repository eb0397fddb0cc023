use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::state::SharedState;

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Ping the shared store forever, keeping the shared state in degraded mode while it fails.
pub async fn run(state: SharedState) {
    let mut delay = INITIAL_DELAY;

    loop {
        match state.store().health_check().await {
            Ok(()) => {
                if state.is_degraded() {
                    info!("store healthy again; leaving degraded mode");
                    state.update_degraded(false);
                }
                delay = INITIAL_DELAY;
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(err) => {
                if state.is_degraded() {
                    warn!(error = %err, retry_in = ?delay, "store still unavailable");
                } else {
                    warn!(error = %err, "store health check failed; entering degraded mode");
                    state.update_degraded(true);
                }
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}
