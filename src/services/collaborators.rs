//! Seams to the systems around the mute engine: outbound identities, voice
//! roster, presentation, statistics, metrics and guild settings.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, future::BoxFuture};
use indexmap::IndexMap;
use thiserror::Error;
use tracing::info;

use crate::{
    config::AppConfig,
    dto::{job::GameOverPayload, session::SessionSummary},
    state::rules::{PhaseDelayTable, VoiceRuleTable},
};

/// Failure reported by an outbound identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The platform answered with an error status.
    #[error("request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
    /// The platform could not be reached.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// One outbound API credential able to change voice state.
pub trait IdentityClient: Send + Sync {
    /// Stable identifier used in rate and blacklist keys.
    fn id(&self) -> &str;

    /// Server-mute / server-deafen `user_id` in `guild_id`.
    fn set_voice_state(
        &self,
        guild_id: &str,
        user_id: &str,
        mute: bool,
        deaf: bool,
    ) -> BoxFuture<'static, Result<(), ApiError>>;

    /// Whether this identity is still a member of `guild_id`.
    fn is_guild_member(&self, guild_id: &str) -> BoxFuture<'static, Result<bool, ApiError>>;

    /// Leave `guild_id`.
    fn leave_guild(&self, guild_id: &str) -> BoxFuture<'static, Result<(), ApiError>>;
}

/// A guild member currently connected to voice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceMember {
    pub user_id: String,
    pub username: String,
    pub nick: Option<String>,
    pub channel_id: String,
    pub mute: bool,
    pub deaf: bool,
}

impl VoiceMember {
    /// Names a member may appear under in game, nickname first.
    pub fn display_names(&self) -> impl Iterator<Item = &str> {
        self.nick.as_deref().into_iter().chain([self.username.as_str()])
    }
}

/// Source of truth for who is in voice, maintained by the platform gateway.
pub trait VoiceRoster: Send + Sync {
    fn voice_members(&self, guild_id: &str) -> BoxFuture<'static, Vec<VoiceMember>>;
}

/// Renders sessions for humans.
pub trait Presentation: Send + Sync {
    fn refresh(&self, summary: &SessionSummary);
    fn game_over(&self, summary: &SessionSummary, result: &GameOverPayload);
}

/// Best-effort match statistics.
pub trait StatsRecorder: Send + Sync {
    fn match_started(
        &self,
        guild_id: &str,
        connect_code: &str,
        match_id: i64,
        start_unix: i64,
    ) -> BoxFuture<'static, ()>;

    fn match_ended(
        &self,
        guild_id: &str,
        match_id: i64,
        result: &GameOverPayload,
    ) -> BoxFuture<'static, ()>;
}

/// Per-batch dispatch outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    /// Applied by a secondary identity.
    pub worker: u32,
    /// Applied by the capture client.
    pub capture: u32,
    /// Applied by the primary identity.
    pub official: u32,
    /// Changes that found at least one link out of rate budget.
    pub rate_limited: u32,
    /// Changes nobody could apply.
    pub failed: u32,
}

impl OutcomeCounts {
    pub fn applied(&self) -> u32 {
        self.worker + self.capture + self.official
    }
}

pub trait MetricsSink: Send + Sync {
    fn record_batch(&self, guild_id: &str, counts: &OutcomeCounts);
}

/// Settings the engine reads for one guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuildSettings {
    pub voice_rules: VoiceRuleTable,
    pub phase_delays: PhaseDelayTable,
    pub mute_spectators: bool,
    pub unmute_dead_during_tasks: bool,
    /// Secondary identities this guild may use.
    pub secondary_budget: usize,
}

impl From<&AppConfig> for GuildSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            voice_rules: config.voice_rules.clone(),
            phase_delays: config.phase_delays.clone(),
            mute_spectators: config.mute_spectators,
            unmute_dead_during_tasks: config.unmute_dead_during_tasks,
            secondary_budget: config.secondary_budget,
        }
    }
}

pub trait SettingsProvider: Send + Sync {
    fn guild_settings(&self, guild_id: &str) -> BoxFuture<'static, GuildSettings>;
}

/// Settings from configuration, with optional per-guild overrides.
pub struct StaticSettings {
    defaults: GuildSettings,
    overrides: DashMap<String, GuildSettings>,
}

impl StaticSettings {
    pub fn new(defaults: GuildSettings) -> Self {
        Self {
            defaults,
            overrides: DashMap::new(),
        }
    }

    /// Replace the settings of one guild.
    pub fn set_guild(&self, guild_id: impl Into<String>, settings: GuildSettings) {
        self.overrides.insert(guild_id.into(), settings);
    }
}

impl SettingsProvider for StaticSettings {
    fn guild_settings(&self, guild_id: &str) -> BoxFuture<'static, GuildSettings> {
        let settings = self
            .overrides
            .get(guild_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.defaults.clone());
        futures::future::ready(settings).boxed()
    }
}

/// Voice roster fed by whoever observes the platform's voice events.
#[derive(Default)]
pub struct InMemoryVoiceRoster {
    guilds: DashMap<String, IndexMap<String, VoiceMember>>,
}

impl InMemoryVoiceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a member's voice presence.
    pub fn upsert(&self, guild_id: &str, member: VoiceMember) {
        self.guilds
            .entry(guild_id.to_string())
            .or_default()
            .insert(member.user_id.clone(), member);
    }

    /// Member left voice.
    pub fn remove(&self, guild_id: &str, user_id: &str) {
        if let Some(mut members) = self.guilds.get_mut(guild_id) {
            members.shift_remove(user_id);
        }
    }

    /// Record a server mute/deafen observed on the platform.
    pub fn apply_voice_state(&self, guild_id: &str, user_id: &str, mute: bool, deaf: bool) {
        if let Some(mut members) = self.guilds.get_mut(guild_id)
            && let Some(member) = members.get_mut(user_id)
        {
            member.mute = mute;
            member.deaf = deaf;
        }
    }

    pub fn member(&self, guild_id: &str, user_id: &str) -> Option<VoiceMember> {
        self.guilds
            .get(guild_id)
            .and_then(|members| members.get(user_id).cloned())
    }
}

impl VoiceRoster for InMemoryVoiceRoster {
    fn voice_members(&self, guild_id: &str) -> BoxFuture<'static, Vec<VoiceMember>> {
        let members = self
            .guilds
            .get(guild_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default();
        futures::future::ready(members).boxed()
    }
}

/// Presentation that only logs.
pub struct LogPresentation;

impl Presentation for LogPresentation {
    fn refresh(&self, summary: &SessionSummary) {
        info!(
            connect_code = %summary.connect_code,
            phase = %summary.phase,
            players = summary.players.len(),
            running = summary.running,
            "session refreshed"
        );
    }

    fn game_over(&self, summary: &SessionSummary, result: &GameOverPayload) {
        info!(
            connect_code = %summary.connect_code,
            reason = result.reason,
            crew_won = result.crew_won(),
            "match ended"
        );
    }
}

/// Stats recorder that only logs.
pub struct LogStats;

impl StatsRecorder for LogStats {
    fn match_started(
        &self,
        guild_id: &str,
        connect_code: &str,
        match_id: i64,
        start_unix: i64,
    ) -> BoxFuture<'static, ()> {
        info!(guild_id, connect_code, match_id, start_unix, "match started");
        futures::future::ready(()).boxed()
    }

    fn match_ended(
        &self,
        guild_id: &str,
        match_id: i64,
        result: &GameOverPayload,
    ) -> BoxFuture<'static, ()> {
        info!(
            guild_id,
            match_id,
            players = result.player_infos.len(),
            crew_won = result.crew_won(),
            "match recorded"
        );
        futures::future::ready(()).boxed()
    }
}

/// Metrics sink that only logs.
pub struct LogMetrics;

impl MetricsSink for LogMetrics {
    fn record_batch(&self, guild_id: &str, counts: &OutcomeCounts) {
        info!(
            guild_id,
            worker = counts.worker,
            capture = counts.capture,
            official = counts.official,
            rate_limited = counts.rate_limited,
            failed = counts.failed,
            "mute batch complete"
        );
    }
}

/// Every collaborator the engine talks to, bundled for wiring.
#[derive(Clone)]
pub struct Collaborators {
    pub roster: Arc<dyn VoiceRoster>,
    pub presentation: Arc<dyn Presentation>,
    pub stats: Arc<dyn StatsRecorder>,
    pub metrics: Arc<dyn MetricsSink>,
    pub settings: Arc<dyn SettingsProvider>,
}

impl Collaborators {
    /// Logging collaborators with an empty in-memory roster.
    pub fn logging(config: &AppConfig) -> Self {
        Self {
            roster: Arc::new(InMemoryVoiceRoster::new()),
            presentation: Arc::new(LogPresentation),
            stats: Arc::new(LogStats),
            metrics: Arc::new(LogMetrics),
            settings: Arc::new(StaticSettings::new(GuildSettings::from(config))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(user_id: &str, nick: Option<&str>) -> VoiceMember {
        VoiceMember {
            user_id: user_id.into(),
            username: format!("{user_id}-name"),
            nick: nick.map(str::to_string),
            channel_id: "voice".into(),
            mute: false,
            deaf: false,
        }
    }

    #[tokio::test]
    async fn roster_tracks_members_and_their_state() {
        let roster = InMemoryVoiceRoster::new();
        roster.upsert("g", member("u1", Some("Red")));
        roster.upsert("g", member("u2", None));
        roster.apply_voice_state("g", "u1", true, false);

        let members = roster.voice_members("g").await;
        assert_eq!(members.len(), 2);
        assert!(members[0].mute);
        assert_eq!(
            members[0].display_names().collect::<Vec<_>>(),
            ["Red", "u1-name"]
        );

        roster.remove("g", "u1");
        assert!(roster.member("g", "u1").is_none());
        assert!(roster.voice_members("other").await.is_empty());
    }

    #[tokio::test]
    async fn guild_overrides_win_over_defaults() {
        let config = AppConfig::default();
        let settings = StaticSettings::new(GuildSettings::from(&config));
        let mut premium = GuildSettings::from(&config);
        premium.secondary_budget = 3;
        settings.set_guild("premium", premium);

        assert_eq!(settings.guild_settings("premium").await.secondary_budget, 3);
        assert_eq!(settings.guild_settings("free").await.secondary_budget, 0);
    }
}
