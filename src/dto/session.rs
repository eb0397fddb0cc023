//! DTO definitions used by the session administration REST API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::state::{player::color_name, session::SessionRecord};

/// Request to start a session bound to a text and voice channel.
#[derive(Debug, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    #[validate(length(min = 1))]
    pub guild_id: String,
    #[validate(length(min = 1))]
    pub text_channel_id: String,
    /// Voice channel to enforce; empty tracks every voice channel of the guild.
    #[serde(default)]
    pub voice_channel_id: String,
}

/// Identifiers of a freshly started session.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
    pub connect_code: String,
}

/// Generic acknowledgement for session commands.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionActionResponse {
    pub session_id: String,
    pub action: String,
}

impl SessionActionResponse {
    pub fn new(session_id: impl Into<String>, action: &str) -> Self {
        Self {
            session_id: session_id.into(),
            action: action.to_string(),
        }
    }
}

/// One player row of a [`SessionSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSummary {
    pub name: String,
    pub color: String,
    pub is_alive: bool,
    /// Platform user linked to the player.
    pub user_id: Option<String>,
}

/// Read-only projection of a session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub guild_id: String,
    pub connect_code: String,
    pub linked: bool,
    pub running: bool,
    pub phase: String,
    pub room: String,
    pub region: String,
    pub map: String,
    pub match_id: i64,
    pub players: Vec<PlayerSummary>,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        let players = record
            .game
            .players
            .values()
            .map(|player| PlayerSummary {
                name: player.name.clone(),
                color: color_name(player.color).unwrap_or("unknown").to_string(),
                is_alive: player.is_alive,
                user_id: record.user_for_player(&player.name).map(str::to_string),
            })
            .collect();
        Self {
            session_id: record.session_id.clone(),
            guild_id: record.guild_id.clone(),
            connect_code: record.connect_code.clone(),
            linked: record.linked,
            running: record.running,
            phase: record.game.phase.to_string(),
            room: record.game.room.clone(),
            region: record.game.region.clone(),
            map: format!("{:?}", record.game.map).to_lowercase(),
            match_id: record.match_id,
            players,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::player::{PlayerAction, PlayerUpdate};

    #[test]
    fn start_request_requires_guild_and_text_channel() {
        let request: StartSessionRequest =
            serde_json::from_str(r#"{"guildId":"g","textChannelId":"t"}"#).unwrap();
        assert!(request.validate().is_ok());
        assert!(request.voice_channel_id.is_empty());

        let request: StartSessionRequest =
            serde_json::from_str(r#"{"guildId":"","textChannelId":"t"}"#).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn summary_lists_players_with_their_links() {
        let mut record = SessionRecord::new("g", "CODE", "t", "v");
        record.game.update_player(&PlayerUpdate {
            action: PlayerAction::Joined,
            name: "Red".into(),
            color: 0,
            is_dead: false,
            disconnected: false,
        });
        record.link("u1", "red");

        let summary = SessionSummary::from(&record);
        assert_eq!(summary.phase, "UNINITIALIZED");
        assert_eq!(summary.map, "empty");
        assert_eq!(
            summary.players,
            vec![PlayerSummary {
                name: "Red".into(),
                color: "red".into(),
                is_alive: true,
                user_id: Some("u1".into()),
            }]
        );
    }
}
