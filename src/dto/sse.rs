use serde::Serialize;
use utoipa::ToSchema;

use crate::dto::{
    job::GameOverPayload,
    session::SessionSummary,
};

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    pub event: Option<String>,
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Broadcast when the store enters or leaves degraded mode.
pub struct SystemStatus {
    pub degraded: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Result of one player in a finished match.
pub struct PlayerOutcome {
    pub name: String,
    pub is_impostor: bool,
    pub won: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
/// Broadcast once a match ends.
pub struct GameOverEvent {
    pub session: SessionSummary,
    pub reason: i32,
    pub crew_won: bool,
    pub players: Vec<PlayerOutcome>,
}

impl GameOverEvent {
    pub fn new(session: SessionSummary, summary: &GameOverPayload) -> Self {
        let players = summary
            .player_infos
            .iter()
            .map(|info| PlayerOutcome {
                name: info.name.clone(),
                is_impostor: info.is_impostor,
                won: summary.player_won(info),
            })
            .collect();
        Self {
            session,
            reason: summary.reason,
            crew_won: summary.crew_won(),
            players,
        }
    }
}
