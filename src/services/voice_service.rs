//! Decide which voice members need a mute/deafen change for a session.

use crate::{
    services::collaborators::{GuildSettings, VoiceMember},
    state::{
        game::Phase,
        player::PlayerAction,
        rules::VoiceRule,
        session::SessionRecord,
    },
};

/// One member whose voice state has to change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceChange {
    pub user_id: String,
    pub mute: bool,
    pub deaf: bool,
    /// Alive flag the change was evaluated with, used for batch ordering.
    pub alive: bool,
}

/// Whether `member` is subject to this session's rules.
pub fn is_tracked(record: &SessionRecord, member: &VoiceMember) -> bool {
    record.voice_channel_id.is_empty() || member.channel_id == record.voice_channel_id
}

/// Build the change-set for a session and store the evaluated state in its linkage.
///
/// Paused sessions yield no changes. Unlinked members count as dead only when
/// spectators are muted, otherwise they are left alone.
pub fn plan_voice_changes(
    record: &mut SessionRecord,
    members: &[VoiceMember],
    settings: &GuildSettings,
) -> Vec<VoiceChange> {
    if !record.running {
        return Vec::new();
    }
    let phase = record.game.phase;
    let mut changes = Vec::new();

    for member in members {
        let tracked = is_tracked(record, member);
        let alive = match record.linkage.get(&member.user_id) {
            Some(link) => record
                .game
                .find_by_name(&link.ingame_name)
                .map(|player| player.is_alive),
            None => None,
        };

        let (rule, alive) = match alive {
            Some(alive) => (
                settings.voice_rules.evaluate(alive, tracked, phase),
                alive,
            ),
            None if settings.mute_spectators => {
                (settings.voice_rules.evaluate(false, tracked, phase), false)
            }
            None => continue,
        };

        if let Some(link) = record.linkage.get_mut(&member.user_id) {
            link.desired_mute = rule.mute;
            link.desired_deaf = rule.deaf;
        }

        if member.mute != rule.mute || member.deaf != rule.deaf {
            changes.push(VoiceChange {
                user_id: member.user_id.clone(),
                mute: rule.mute,
                deaf: rule.deaf,
                alive,
            });
        }
    }
    changes
}

/// Un-mute and un-deafen every tracked member currently silenced.
pub fn plan_restore(record: &SessionRecord, members: &[VoiceMember]) -> Vec<VoiceChange> {
    members
        .iter()
        .filter(|member| is_tracked(record, member) && (member.mute || member.deaf))
        .map(|member| VoiceChange {
            user_id: member.user_id.clone(),
            mute: VoiceRule::OPEN.mute,
            deaf: VoiceRule::OPEN.deaf,
            alive: true,
        })
        .collect()
}

/// Order a batch so the most urgent changes for the destination phase go first.
///
/// Entering TASKS puts alive players first, entering DISCUSS puts dead players
/// first; the sort is stable.
pub fn prioritize(changes: &mut [VoiceChange], dest: Phase) {
    match dest {
        Phase::Tasks => changes.sort_by_key(|change| !change.alive),
        Phase::Discuss => changes.sort_by_key(|change| change.alive),
        _ => {}
    }
}

/// Whether a player update must not trigger a voice re-evaluation.
///
/// A death during TASKS would be revealed by the resulting mute change, so it
/// waits for the next phase change. Exile is public and never suppressed.
pub fn suppresses_voice_update(
    phase: Phase,
    action: PlayerAction,
    alive_changed: bool,
    settings: &GuildSettings,
) -> bool {
    phase == Phase::Tasks
        && alive_changed
        && action != PlayerAction::Exiled
        && !settings.unmute_dead_during_tasks
}
