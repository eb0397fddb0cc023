//! Shared handles of the session engine and the voice re-evaluation path.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{sync::watch, time::sleep};
use tracing::{debug, warn};

use crate::{
    config::AppConfig,
    dao::{
        shared_store::{SharedStateStore, VoiceChangeLock},
        storage::StoreResult,
    },
    dto::session::SessionSummary,
    services::{
        collaborators::{Collaborators, GuildSettings},
        event_queue::EventQueue,
        locking::{RetryPolicy, lock_and_load},
        mute_dispatcher::{BatchReport, DispatchRequest, MuteDispatcher},
        voice_service::{VoiceChange, plan_restore, plan_voice_changes, prioritize},
    },
    state::{game::Phase, session::SessionRecord},
};

/// Margin added to the phase delay when sizing the voice-change lock.
const VOICE_LOCK_MARGIN: Duration = Duration::from_secs(1);

/// Everything a session loop or an admin command needs to act on sessions.
pub struct SessionRuntime {
    store: SharedStateStore,
    dispatcher: Arc<MuteDispatcher>,
    collaborators: Collaborators,
    config: Arc<AppConfig>,
    /// Latest re-evaluation requested while a batch was already in flight, per session.
    pending: DashMap<String, (Phase, Duration)>,
    /// Never signalled; handed to batches that no session loop owns.
    detached: watch::Sender<bool>,
}

impl SessionRuntime {
    pub fn new(
        store: SharedStateStore,
        dispatcher: Arc<MuteDispatcher>,
        collaborators: Collaborators,
        config: Arc<AppConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            dispatcher,
            collaborators,
            config,
            pending: DashMap::new(),
            detached: watch::channel(false).0,
        })
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn dispatcher(&self) -> &Arc<MuteDispatcher> {
        &self.dispatcher
    }

    /// Shutdown signal for batches scheduled outside a session loop.
    pub fn detached_shutdown(&self) -> watch::Receiver<bool> {
        self.detached.subscribe()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(self.config.as_ref())
    }

    /// Job queue of the capture client identified by `connect_code`.
    pub fn queue(&self, connect_code: &str) -> EventQueue {
        EventQueue::new(self.store.clone(), connect_code, self.config.queue_ttl)
    }

    pub async fn settings(&self, guild_id: &str) -> GuildSettings {
        self.collaborators.settings.guild_settings(guild_id).await
    }

    /// Push the current record to the presentation layer.
    pub fn refresh(&self, record: &SessionRecord) {
        self.collaborators
            .presentation
            .refresh(&SessionSummary::from(record));
    }

    /// Evaluate the voice rules of a session and dispatch the differences.
    ///
    /// The evaluated flags are written back under the session lock before the
    /// batch leaves, so the lock is never held while the platform is called.
    pub async fn apply_voice_rules(&self, session_id: &str, dest: Phase) -> StoreResult<BatchReport> {
        let Some((mut record, lock)) =
            lock_and_load(&self.store, session_id, self.retry_policy()).await?
        else {
            return Ok(BatchReport::default());
        };
        let settings = self.settings(&record.guild_id).await;
        let members = self
            .collaborators
            .roster
            .voice_members(&record.guild_id)
            .await;
        let mut changes = plan_voice_changes(&mut record, &members, &settings);
        self.store.put_session(&record, Some(lock)).await?;

        prioritize(&mut changes, dest);
        Ok(self.dispatch(&record, changes, &settings).await)
    }

    /// Un-mute and un-deafen every tracked member of the session.
    pub async fn restore_voice(&self, record: &SessionRecord) -> BatchReport {
        let settings = self.settings(&record.guild_id).await;
        let members = self
            .collaborators
            .roster
            .voice_members(&record.guild_id)
            .await;
        let changes = plan_restore(record, &members);
        self.dispatch(record, changes, &settings).await
    }

    async fn dispatch(
        &self,
        record: &SessionRecord,
        changes: Vec<VoiceChange>,
        settings: &GuildSettings,
    ) -> BatchReport {
        if changes.is_empty() {
            return BatchReport::default();
        }
        let connect_code = if record.linked {
            record.connect_code.clone()
        } else {
            String::new()
        };
        let report = self
            .dispatcher
            .dispatch(DispatchRequest {
                guild_id: record.guild_id.clone(),
                connect_code,
                changes,
                secondary_budget: settings.secondary_budget,
            })
            .await;
        if let Some(err) = &report.last_error {
            warn!(
                session_id = %record.session_id,
                failed = report.counts.failed,
                error = %err,
                "voice batch finished with errors"
            );
        }
        report
    }

    /// Schedule a voice batch for `origin -> dest`, delayed by the phase delay.
    ///
    /// Returns `false` when another batch of the session is in flight; the
    /// request is then handed to that batch, which re-runs once with the
    /// latest destination. `shutdown` cancels pending delays.
    pub async fn schedule_voice_update(
        self: &Arc<Self>,
        record: &SessionRecord,
        origin: Phase,
        dest: Phase,
        shutdown: watch::Receiver<bool>,
    ) -> StoreResult<bool> {
        let settings = self.settings(&record.guild_id).await;
        let delay = settings.phase_delays.duration(origin, dest);
        let session_id = record.session_id.clone();

        if let Some(lock) = self.try_voice_lock(&session_id, delay).await? {
            self.spawn_voice_batch(session_id, lock, (dest, delay), shutdown);
            return Ok(true);
        }

        self.pending.insert(session_id.clone(), (dest, delay));
        // the batch in flight may have finished between the two steps
        if let Some(lock) = self.try_voice_lock(&session_id, delay).await? {
            let request = self
                .pending
                .remove(&session_id)
                .map_or((dest, delay), |(_, request)| request);
            self.spawn_voice_batch(session_id, lock, request, shutdown);
            return Ok(true);
        }
        Ok(false)
    }

    async fn try_voice_lock(
        &self,
        session_id: &str,
        delay: Duration,
    ) -> StoreResult<Option<VoiceChangeLock>> {
        self.store
            .acquire_voice_change_lock(session_id, delay + VOICE_LOCK_MARGIN)
            .await
    }

    async fn release_voice_lock(&self, session_id: &str, lock: VoiceChangeLock) {
        if let Err(err) = self.store.release_voice_change_lock(lock).await {
            debug!(%session_id, error = %err, "voice lock left to expire");
        }
    }

    /// Claim a request handed over while a batch ran, under a fresh lock sized
    /// for its own delay. `None` when nothing is pending or another batch owns it.
    async fn take_pending(
        &self,
        session_id: &str,
    ) -> Option<(VoiceChangeLock, (Phase, Duration))> {
        loop {
            let sized_for = self.pending.get(session_id).map(|entry| entry.1)?;
            let lock = match self.try_voice_lock(session_id, sized_for).await {
                Ok(Some(lock)) => lock,
                Ok(None) => {
                    debug!(session_id, "another batch took over the pending voice update");
                    return None;
                }
                Err(err) => {
                    warn!(session_id, error = %err, "failed to re-acquire the voice-change lock");
                    return None;
                }
            };
            match self.pending.remove(session_id) {
                Some((_, next)) if next.1 <= sized_for => return Some((lock, next)),
                // replaced by a longer delay in the meantime
                Some((_, next)) => {
                    self.pending.entry(session_id.to_string()).or_insert(next);
                    self.release_voice_lock(session_id, lock).await;
                }
                None => {
                    self.release_voice_lock(session_id, lock).await;
                    return None;
                }
            }
        }
    }

    fn spawn_voice_batch(
        self: &Arc<Self>,
        session_id: String,
        lock: VoiceChangeLock,
        request: (Phase, Duration),
        mut shutdown: watch::Receiver<bool>,
    ) {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut lock = lock;
            let (mut dest, mut delay) = request;
            loop {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {
                            debug!(%session_id, "voice batch cancelled during its delay");
                            runtime.pending.remove(&session_id);
                            runtime.release_voice_lock(&session_id, lock).await;
                            return;
                        }
                    }
                }
                match runtime.apply_voice_rules(&session_id, dest).await {
                    Ok(report) => debug!(
                        %session_id,
                        phase = %dest,
                        applied = report.counts.applied(),
                        failed = report.counts.failed,
                        "voice batch applied"
                    ),
                    Err(err) => warn!(%session_id, error = %err, "voice batch aborted"),
                }

                runtime.release_voice_lock(&session_id, lock).await;
                let Some((relocked, next)) = runtime.take_pending(&session_id).await else {
                    return;
                };
                lock = relocked;
                (dest, delay) = next;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::shared_store::MemoryBackend, dto::session::StartSessionRequest,
        services::session_service, state::AppState,
    };

    #[tokio::test(start_paused = true)]
    async fn handed_over_request_holds_a_lock_sized_for_its_delay() {
        let state = AppState::new(
            AppConfig::default(),
            Arc::new(MemoryBackend::new()),
            None,
            Vec::new(),
        );
        let started = session_service::start_session(
            &state,
            StartSessionRequest {
                guild_id: "guild".into(),
                text_channel_id: "text".into(),
                voice_channel_id: "voice".into(),
            },
        )
        .await
        .unwrap();
        let runtime = state.runtime();
        let record = state
            .store()
            .get_session(&started.session_id)
            .await
            .unwrap()
            .unwrap();

        let shutdown = runtime.detached_shutdown();
        assert!(
            runtime
                .schedule_voice_update(&record, Phase::Menu, Phase::Lobby, shutdown.clone())
                .await
                .unwrap()
        );
        assert!(
            !runtime
                .schedule_voice_update(&record, Phase::Lobby, Phase::Tasks, shutdown)
                .await
                .unwrap()
        );

        // the lobby batch is done; the 7s tasks batch must still own the lock
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(
            runtime
                .store()
                .acquire_voice_change_lock(&started.session_id, Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(
            runtime
                .store()
                .acquire_voice_change_lock(&started.session_id, Duration::from_secs(1))
                .await
                .unwrap()
                .is_some()
        );
    }
}
