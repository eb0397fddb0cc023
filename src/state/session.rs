use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{game::SessionGameData, player::names_match};

/// Match id carried by sessions with no match in progress.
pub const NO_MATCH: i64 = -1;

/// Where the session's status message lives on the chat platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub id: String,
    pub channel_id: String,
    pub leader_id: String,
    pub created_at: i64,
}

/// A platform user bound to an in-game player, with the voice state last decided for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linkage {
    pub ingame_name: String,
    #[serde(default)]
    pub desired_mute: bool,
    #[serde(default)]
    pub desired_deaf: bool,
}

/// Authoritative per-session aggregate, written only by the current lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Canonical key of the session inside the shared store.
    pub session_id: String,
    pub guild_id: String,
    pub connect_code: String,
    /// Whether a capture client is currently connected.
    pub linked: bool,
    /// `false` suspends voice enforcement without dropping state.
    pub running: bool,
    /// Whether a session loop is consuming the job queue.
    pub subscribed: bool,
    pub match_id: i64,
    pub match_start_unix: i64,
    pub voice_channel_id: String,
    pub message: MessagePointer,
    /// Linked users keyed by platform user id.
    pub linkage: IndexMap<String, Linkage>,
    pub game: SessionGameData,
    /// Generation of the loop allowed to consume this session's queue.
    #[serde(default)]
    pub consumer_generation: u64,
}

impl SessionRecord {
    /// Fresh record for a session that is about to start.
    pub fn new(
        guild_id: impl Into<String>,
        connect_code: impl Into<String>,
        text_channel_id: impl Into<String>,
        voice_channel_id: impl Into<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            guild_id: guild_id.into(),
            connect_code: connect_code.into(),
            linked: false,
            running: true,
            subscribed: false,
            match_id: NO_MATCH,
            match_start_unix: 0,
            voice_channel_id: voice_channel_id.into(),
            message: MessagePointer {
                channel_id: text_channel_id.into(),
                ..MessagePointer::default()
            },
            linkage: IndexMap::new(),
            game: SessionGameData::default(),
            consumer_generation: 0,
        }
    }

    /// Text channel the session was started from.
    pub fn text_channel_id(&self) -> &str {
        &self.message.channel_id
    }

    /// Whether a match started and has not been closed by a game-over summary.
    pub fn match_in_progress(&self) -> bool {
        self.match_id != NO_MATCH
    }

    /// Mark a new match as started.
    pub fn start_match(&mut self, match_id: i64, start_unix: i64) {
        self.match_id = match_id;
        self.match_start_unix = start_unix;
    }

    /// Clear match-in-progress fields.
    pub fn clear_match(&mut self) {
        self.match_id = NO_MATCH;
        self.match_start_unix = 0;
    }

    /// User currently linked to `ingame_name`, if any.
    pub fn user_for_player(&self, ingame_name: &str) -> Option<&str> {
        self.linkage
            .iter()
            .find(|(_, link)| names_match(&link.ingame_name, ingame_name))
            .map(|(user_id, _)| user_id.as_str())
    }

    /// Bind `user_id` to `ingame_name`, replacing any previous binding of that user.
    pub fn link(&mut self, user_id: impl Into<String>, ingame_name: impl Into<String>) {
        let user_id = user_id.into();
        let ingame_name = ingame_name.into();
        match self.linkage.get_mut(&user_id) {
            Some(link) => link.ingame_name = ingame_name,
            None => {
                self.linkage.insert(
                    user_id,
                    Linkage {
                        ingame_name,
                        desired_mute: false,
                        desired_deaf: false,
                    },
                );
            }
        }
    }

    /// Remove whichever user is linked to `ingame_name`, returning their id.
    pub fn unlink_player(&mut self, ingame_name: &str) -> Option<String> {
        let user_id = self.user_for_player(ingame_name)?.to_string();
        self.linkage.shift_remove(&user_id);
        Some(user_id)
    }
}
