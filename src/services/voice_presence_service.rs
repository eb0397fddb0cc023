use std::sync::Arc;

use tracing::debug;

use crate::{
    dto::voice::VoicePresenceRequest,
    error::ServiceError,
    services::collaborators::InMemoryVoiceRoster,
    state::SharedState,
};

/// Record that `user_id` is connected to voice in `guild_id`.
///
/// The next voice batch and the next player pairing of every session in the
/// guild see the updated roster.
pub fn update_presence(
    state: &SharedState,
    guild_id: &str,
    user_id: &str,
    presence: VoicePresenceRequest,
) -> Result<(), ServiceError> {
    let roster = roster(state)?;
    let member = presence.into_member(user_id.to_string());
    debug!(
        guild_id,
        user_id,
        channel_id = %member.channel_id,
        mute = member.mute,
        deaf = member.deaf,
        "voice presence updated"
    );
    roster.upsert(guild_id, member);
    Ok(())
}

/// Record that `user_id` left voice in `guild_id`.
pub fn remove_presence(
    state: &SharedState,
    guild_id: &str,
    user_id: &str,
) -> Result<(), ServiceError> {
    roster(state)?.remove(guild_id, user_id);
    debug!(guild_id, user_id, "voice presence removed");
    Ok(())
}

fn roster(state: &SharedState) -> Result<&Arc<InMemoryVoiceRoster>, ServiceError> {
    state.voice_presence().ok_or_else(|| {
        ServiceError::InvalidState("voice presence is fed by an external roster".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        dao::shared_store::MemoryBackend,
        services::{
            collaborators::{Collaborators, VoiceRoster},
            sse_service::EventHub,
        },
        state::AppState,
    };

    fn presence(channel_id: &str, mute: bool) -> VoicePresenceRequest {
        VoicePresenceRequest {
            channel_id: channel_id.into(),
            username: "red-account".into(),
            nick: Some("Red".into()),
            mute,
            deaf: false,
        }
    }

    #[tokio::test]
    async fn presence_updates_feed_the_session_roster() {
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(MemoryBackend::new()),
            None,
            Vec::new(),
        );
        let roster = state.runtime().collaborators().roster.clone();

        update_presence(&state, "guild", "u-red", presence("voice", false)).unwrap();
        update_presence(&state, "guild", "u-red", presence("afk", true)).unwrap();
        let members = roster.voice_members("guild").await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].channel_id, "afk");
        assert!(members[0].mute);

        remove_presence(&state, "guild", "u-red").unwrap();
        assert!(roster.voice_members("guild").await.is_empty());
    }

    #[tokio::test]
    async fn external_roster_rejects_presence_updates() {
        let config = AppConfig::default();
        let collaborators = Collaborators::logging(&config);
        let state = AppState::with_collaborators(
            config,
            Arc::new(MemoryBackend::new()),
            None,
            Vec::new(),
            collaborators,
            Arc::new(EventHub::new(8)),
        );
        assert!(matches!(
            update_presence(&state, "guild", "u-red", presence("voice", false)),
            Err(ServiceError::InvalidState(_))
        ));
    }
}
