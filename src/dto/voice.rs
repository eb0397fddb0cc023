//! DTO definitions for the voice presence feed.

use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

use crate::services::collaborators::VoiceMember;

/// Voice presence of one platform user, as reported by the gateway feed.
#[derive(Debug, Deserialize, ToSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VoicePresenceRequest {
    /// Voice channel the user is connected to.
    #[validate(length(min = 1))]
    pub channel_id: String,
    #[validate(length(min = 1))]
    pub username: String,
    /// Guild nickname, matched before the username when pairing players.
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default)]
    pub mute: bool,
    #[serde(default)]
    pub deaf: bool,
}

impl VoicePresenceRequest {
    pub fn into_member(self, user_id: String) -> VoiceMember {
        VoiceMember {
            user_id,
            username: self.username,
            nick: self.nick.filter(|nick| !nick.is_empty()),
            channel_id: self.channel_id,
            mute: self.mute,
            deaf: self.deaf,
        }
    }
}
