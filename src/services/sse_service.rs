use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    dto::{
        job::GameOverPayload,
        session::SessionSummary,
        sse::{GameOverEvent, ServerEvent, SystemStatus},
    },
    services::collaborators::Presentation,
};

/// Event name used for session snapshots.
pub const SESSION_EVENT: &str = "session";
/// Event name used for finished matches.
pub const GAME_OVER_EVENT: &str = "game_over";
/// Event name used for degraded mode changes.
pub const SYSTEM_EVENT: &str = "system";

/// Broadcast hub feeding the session SSE stream; doubles as the presentation collaborator.
pub struct EventHub {
    sender: broadcast::Sender<ServerEvent>,
}

impl EventHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.sender.send(event);
    }

    /// Announce a degraded mode change.
    pub fn broadcast_status(&self, degraded: bool) {
        self.broadcast_json(SYSTEM_EVENT, &SystemStatus { degraded });
    }

    fn broadcast_json<T: serde::Serialize>(&self, name: &str, payload: &T) {
        match ServerEvent::json(Some(name.to_string()), payload) {
            Ok(event) => self.broadcast(event),
            Err(err) => warn!(event = name, error = %err, "failed to serialize SSE payload"),
        }
    }
}

impl Presentation for EventHub {
    fn refresh(&self, summary: &SessionSummary) {
        debug!(
            connect_code = %summary.connect_code,
            phase = %summary.phase,
            "broadcasting session snapshot"
        );
        self.broadcast_json(SESSION_EVENT, summary);
    }

    fn game_over(&self, summary: &SessionSummary, result: &GameOverPayload) {
        info!(
            connect_code = %summary.connect_code,
            crew_won = result.crew_won(),
            "broadcasting match result"
        );
        self.broadcast_json(GAME_OVER_EVENT, &GameOverEvent::new(summary.clone(), result));
    }
}

/// Convert a broadcast receiver into an SSE response, forwarding events until
/// the client disconnects.
pub fn to_sse_stream(
    mut receiver: broadcast::Receiver<ServerEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                recv_result = receiver.recv() => {
                    match recv_result {
                        Ok(payload) => {
                            let mut event = Event::default().data(payload.data);
                            if let Some(name) = payload.event {
                                event = event.event(name);
                            }

                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(skipped, "session SSE subscriber lagged");
                            continue;
                        }
                    }
                }
            }
        }
        info!("session SSE stream disconnected");
    });

    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
