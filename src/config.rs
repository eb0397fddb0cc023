//! Application-level configuration loading: dispatch tuning, lock timings and guild voice defaults.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::state::{
    game::Phase,
    rules::{PhaseDelayTable, VoiceRule, VoiceRuleTable},
};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/mutesync.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "MUTESYNC_CONFIG_PATH";
const PRIMARY_TOKEN_ENV: &str = "MUTESYNC_PRIMARY_TOKEN";
const PRIMARY_ID_ENV: &str = "MUTESYNC_PRIMARY_ID";
const DEFAULT_API_BASE_URL: &str = "https://discord.com/api/v10";

/// Credentials of one outbound API identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IdentityConfig {
    pub id: String,
    pub token: String,
}

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Concurrent workers per mute batch.
    pub dispatch_workers: usize,
    pub capture_ack_timeout: Duration,
    /// How long a failing identity or capture code stays disabled.
    pub blacklist_cooldown: Duration,
    pub rate_window: Duration,
    pub rate_threshold: u64,
    pub session_lock_lease: Duration,
    pub lock_backoff_initial: Duration,
    pub lock_backoff_max: Duration,
    /// Silence after which a session loop tears its session down.
    pub inactivity_timeout: Duration,
    pub queue_ttl: Duration,
    pub connect_code_length: usize,
    /// Secondary identities a guild may use when no per-guild setting exists.
    pub secondary_budget: usize,
    pub mute_spectators: bool,
    pub unmute_dead_during_tasks: bool,
    pub voice_rules: VoiceRuleTable,
    pub phase_delays: PhaseDelayTable,
    /// First entry is the primary identity, the rest are secondaries.
    pub identities: Vec<IdentityConfig>,
    pub api_base_url: String,
}

impl AppConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let app_config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        identities = app_config.identities.len(),
                        "loaded configuration"
                    );
                    app_config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        };
        config.apply_env_primary();
        config
    }

    fn apply_env_primary(&mut self) {
        if !self.identities.is_empty() {
            return;
        }
        let Ok(token) = env::var(PRIMARY_TOKEN_ENV) else {
            return;
        };
        let id = env::var(PRIMARY_ID_ENV).unwrap_or_else(|_| "primary".into());
        info!(%id, "using primary identity from the environment");
        self.identities.push(IdentityConfig { id, token });
    }

    /// Primary identity, if configured.
    pub fn primary_identity(&self) -> Option<&IdentityConfig> {
        self.identities.first()
    }

    /// Secondary identities in configuration order.
    pub fn secondary_identities(&self) -> &[IdentityConfig] {
        self.identities.get(1..).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 8,
            capture_ack_timeout: Duration::from_millis(2_000),
            blacklist_cooldown: Duration::from_secs(300),
            rate_window: Duration::from_secs(5),
            rate_threshold: 7,
            session_lock_lease: Duration::from_millis(5_000),
            lock_backoff_initial: Duration::from_millis(10),
            lock_backoff_max: Duration::from_millis(500),
            inactivity_timeout: Duration::from_secs(3_600),
            queue_ttl: Duration::from_secs(3_600),
            connect_code_length: 8,
            secondary_budget: 0,
            mute_spectators: false,
            unmute_dead_during_tasks: false,
            voice_rules: VoiceRuleTable::default(),
            phase_delays: PhaseDelayTable::default(),
            identities: Vec::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    dispatch_workers: Option<usize>,
    capture_ack_timeout_ms: Option<u64>,
    blacklist_cooldown_secs: Option<u64>,
    rate_window_secs: Option<u64>,
    rate_threshold: Option<u64>,
    session_lock_lease_ms: Option<u64>,
    lock_backoff_initial_ms: Option<u64>,
    lock_backoff_max_ms: Option<u64>,
    inactivity_timeout_secs: Option<u64>,
    queue_ttl_secs: Option<u64>,
    connect_code_length: Option<usize>,
    secondary_budget: Option<usize>,
    mute_spectators: Option<bool>,
    unmute_dead_during_tasks: Option<bool>,
    voice_rules: Vec<RawVoiceRule>,
    phase_delays: Vec<RawPhaseDelay>,
    identities: Vec<IdentityConfig>,
    api_base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
/// One `(phase, alive)` cell override of the voice rule table.
struct RawVoiceRule {
    phase: String,
    alive: bool,
    #[serde(default)]
    mute: bool,
    #[serde(default)]
    deaf: bool,
}

#[derive(Debug, Deserialize)]
/// One `origin -> dest` override of the phase delay table.
struct RawPhaseDelay {
    from: String,
    to: String,
    seconds: u64,
}

impl From<RawConfig> for AppConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = AppConfig::default();
        let millis = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        let secs = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_secs).unwrap_or(fallback)
        };

        let mut voice_rules = defaults.voice_rules.clone();
        for rule in raw.voice_rules {
            match Phase::from_label(&rule.phase) {
                Some(phase) => voice_rules.set(
                    phase,
                    rule.alive,
                    VoiceRule {
                        mute: rule.mute,
                        deaf: rule.deaf,
                    },
                ),
                None => warn!(phase = %rule.phase, "ignoring voice rule for unknown phase"),
            }
        }

        let mut phase_delays = defaults.phase_delays.clone();
        for delay in raw.phase_delays {
            match (Phase::from_label(&delay.from), Phase::from_label(&delay.to)) {
                (Some(from), Some(to)) => phase_delays.set(from, to, delay.seconds),
                _ => warn!(
                    from = %delay.from,
                    to = %delay.to,
                    "ignoring phase delay for unknown phase"
                ),
            }
        }

        Self {
            dispatch_workers: raw
                .dispatch_workers
                .unwrap_or(defaults.dispatch_workers)
                .max(1),
            capture_ack_timeout: millis(raw.capture_ack_timeout_ms, defaults.capture_ack_timeout),
            blacklist_cooldown: secs(raw.blacklist_cooldown_secs, defaults.blacklist_cooldown),
            rate_window: secs(raw.rate_window_secs, defaults.rate_window),
            rate_threshold: raw.rate_threshold.unwrap_or(defaults.rate_threshold),
            session_lock_lease: millis(raw.session_lock_lease_ms, defaults.session_lock_lease),
            lock_backoff_initial: millis(raw.lock_backoff_initial_ms, defaults.lock_backoff_initial),
            lock_backoff_max: millis(raw.lock_backoff_max_ms, defaults.lock_backoff_max),
            inactivity_timeout: secs(raw.inactivity_timeout_secs, defaults.inactivity_timeout),
            queue_ttl: secs(raw.queue_ttl_secs, defaults.queue_ttl),
            connect_code_length: raw
                .connect_code_length
                .unwrap_or(defaults.connect_code_length)
                .max(4),
            secondary_budget: raw.secondary_budget.unwrap_or(defaults.secondary_budget),
            mute_spectators: raw.mute_spectators.unwrap_or(defaults.mute_spectators),
            unmute_dead_during_tasks: raw
                .unmute_dead_during_tasks
                .unwrap_or(defaults.unmute_dead_during_tasks),
            voice_rules,
            phase_delays,
            identities: raw.identities,
            api_base_url: raw
                .api_base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base_url),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let raw: RawConfig = serde_json::from_str("{}").unwrap();
        let config = AppConfig::from(raw);
        assert_eq!(config.dispatch_workers, 8);
        assert_eq!(config.rate_threshold, 7);
        assert_eq!(config.blacklist_cooldown, Duration::from_secs(300));
        assert_eq!(config.voice_rules, VoiceRuleTable::default());
        assert!(config.primary_identity().is_none());
        assert!(config.secondary_identities().is_empty());
    }

    #[test]
    fn overrides_rules_delays_and_identities() {
        let raw: RawConfig = serde_json::from_str(
            r#"{
                "dispatch_workers": 2,
                "capture_ack_timeout_ms": 150,
                "voice_rules": [
                    {"phase": "tasks", "alive": true, "mute": true, "deaf": true},
                    {"phase": "nowhere", "alive": true, "mute": true}
                ],
                "phase_delays": [{"from": "LOBBY", "to": "TASKS", "seconds": 2}],
                "identities": [
                    {"id": "main", "token": "a"},
                    {"id": "helper", "token": "b"}
                ],
                "api_base_url": "http://localhost:9000/"
            }"#,
        )
        .unwrap();
        let config = AppConfig::from(raw);

        assert_eq!(config.dispatch_workers, 2);
        assert_eq!(config.capture_ack_timeout, Duration::from_millis(150));
        assert_eq!(
            config.voice_rules.get(Phase::Tasks, true),
            VoiceRule {
                mute: true,
                deaf: true
            }
        );
        assert_eq!(config.phase_delays.delay(Phase::Lobby, Phase::Tasks), 2);
        assert_eq!(config.phase_delays.delay(Phase::Discuss, Phase::Lobby), 6);
        assert_eq!(config.primary_identity().map(|id| id.id.as_str()), Some("main"));
        assert_eq!(config.secondary_identities().len(), 1);
        assert_eq!(config.api_base_url, "http://localhost:9000");
    }
}
