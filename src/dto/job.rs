//! Jobs pushed by the capture client onto a session's queue.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::state::{
    game::{GameMap, Phase, UnknownPhase, region_name},
    player::PlayerUpdate,
};

/// Discriminant of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobType {
    Connection,
    Lobby,
    State,
    Player,
    #[serde(rename = "GAMEOVER")]
    GameOver,
}

/// Raw queue entry: a type tag plus a type-specific string payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct JobEnvelope {
    #[serde(rename = "type")]
    pub kind: JobType,
    pub payload: String,
}

/// Lobby details reported when the capture client enters a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPayload {
    pub lobby_code: String,
    pub region: i32,
    pub map: i32,
}

impl LobbyPayload {
    /// Human readable region.
    pub fn region_name(&self) -> &'static str {
        region_name(self.region)
    }

    pub fn game_map(&self) -> GameMap {
        GameMap::from_wire(self.map)
    }
}

/// Role and name of one player in a finished match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
    pub name: String,
    pub is_impostor: bool,
}

/// End-of-match summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameOverPayload {
    pub reason: i32,
    #[serde(default)]
    pub player_infos: Vec<PlayerInfo>,
}

impl GameOverPayload {
    /// Whether the crew side won. Reasons 0, 1 and 6 are crew victories.
    pub fn crew_won(&self) -> bool {
        matches!(self.reason, 0 | 1 | 6)
    }

    /// Whether `player_name` was on the winning side.
    pub fn player_won(&self, info: &PlayerInfo) -> bool {
        info.is_impostor != self.crew_won()
    }
}

/// A decoded queue job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Capture client linked (`true`) or unlinked (`false`).
    Connection(bool),
    Lobby(LobbyPayload),
    State(Phase),
    Player(PlayerUpdate),
    GameOver(GameOverPayload),
}

/// Failure to decode a queued job. The job is dropped, the queue continues.
#[derive(Debug, Error)]
pub enum JobDecodeError {
    #[error("invalid job envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("invalid {kind:?} payload: {source}")]
    Payload {
        kind: JobType,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid connection flag `{0}`")]
    ConnectionFlag(String),
    #[error(transparent)]
    Phase(#[from] UnknownPhase),
}

impl Job {
    /// Decode a job from its serialized envelope.
    pub fn from_json_str(raw: &str) -> Result<Self, JobDecodeError> {
        let envelope: JobEnvelope = serde_json::from_str(raw).map_err(JobDecodeError::Envelope)?;
        Self::decode(&envelope)
    }

    /// Decode the payload according to the envelope's type.
    pub fn decode(envelope: &JobEnvelope) -> Result<Self, JobDecodeError> {
        let payload = envelope.payload.trim();
        let kind = envelope.kind;
        let json_err = |source| JobDecodeError::Payload { kind, source };
        Ok(match kind {
            JobType::Connection => match payload {
                "true" => Job::Connection(true),
                "false" => Job::Connection(false),
                other => return Err(JobDecodeError::ConnectionFlag(other.to_string())),
            },
            JobType::Lobby => Job::Lobby(serde_json::from_str(payload).map_err(json_err)?),
            JobType::State => Job::State(payload.parse()?),
            JobType::Player => Job::Player(serde_json::from_str(payload).map_err(json_err)?),
            JobType::GameOver => Job::GameOver(serde_json::from_str(payload).map_err(json_err)?),
        })
    }

    pub fn kind(&self) -> JobType {
        match self {
            Job::Connection(_) => JobType::Connection,
            Job::Lobby(_) => JobType::Lobby,
            Job::State(_) => JobType::State,
            Job::Player(_) => JobType::Player,
            Job::GameOver(_) => JobType::GameOver,
        }
    }

    /// Encode back into the queue representation.
    pub fn to_envelope(&self) -> Result<JobEnvelope, serde_json::Error> {
        let payload = match self {
            Job::Connection(linked) => linked.to_string(),
            Job::Lobby(lobby) => serde_json::to_string(lobby)?,
            Job::State(phase) => i32::from(*phase).to_string(),
            Job::Player(update) => serde_json::to_string(update)?,
            Job::GameOver(summary) => serde_json::to_string(summary)?,
        };
        Ok(JobEnvelope {
            kind: self.kind(),
            payload,
        })
    }
}

/// Instruction for the capture client to change one member's voice state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModifyTask {
    pub task_id: String,
    pub guild_id: String,
    pub user_id: String,
    pub mute: bool,
    pub deaf: bool,
}
