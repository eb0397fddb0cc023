//! Per-session consumer of the capture job queue.
//!
//! One loop runs per live session. It is the only writer of the game view,
//! applies every job under the session lock and triggers voice
//! re-evaluation. Kill signals, inactivity and a newer consumer stop it.

use std::sync::Arc;

use futures::{StreamExt, stream::BoxStream};
use rand::Rng;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    dao::{keys, shared_store::SessionLock},
    dto::{
        job::{GameOverPayload, Job, LobbyPayload},
        session::SessionSummary,
    },
    error::ServiceError,
    services::{
        event_queue::{EventQueue, QueueError},
        locking::lock_and_load,
        pairing::{pair_by_matching_names, pair_by_user_ids},
        runtime::SessionRuntime,
        voice_service::{is_tracked, suppresses_voice_update},
    },
    state::{
        game::Phase,
        player::{PlayerAction, PlayerUpdate, is_valid_color},
        session::SessionRecord,
    },
};

/// Why a session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A kill signal was published for the session.
    Killed,
    /// No job arrived within the inactivity timeout.
    Inactive,
    /// A newer consumer claimed the session.
    Superseded,
    /// The record disappeared from the store.
    Gone,
    /// The notify subscription closed.
    ChannelClosed,
}

enum Flow {
    Continue,
    Stop(StopReason),
}

/// Consumer of one session's job queue.
pub struct SessionEventLoop {
    runtime: Arc<SessionRuntime>,
    session_id: String,
    connect_code: String,
    queue: EventQueue,
    generation: u64,
    shutdown: watch::Sender<bool>,
}

impl SessionEventLoop {
    /// Claim the session's queue and run its loop in the background.
    ///
    /// Claiming bumps the consumer generation, which makes any older loop of
    /// the same session stop at its next job.
    pub async fn spawn(
        runtime: Arc<SessionRuntime>,
        session_id: &str,
    ) -> Result<JoinHandle<StopReason>, ServiceError> {
        let store = runtime.store();
        let Some((mut record, lock)) =
            lock_and_load(store, session_id, runtime.retry_policy()).await?
        else {
            return Err(ServiceError::NotFound(format!("session {session_id}")));
        };
        record.consumer_generation += 1;
        record.subscribed = true;
        let generation = record.consumer_generation;
        store.put_session(&record, Some(lock)).await?;

        let queue = runtime.queue(&record.connect_code);
        let notify = queue.subscribe_notify().await?;
        let kill = store.subscribe(keys::kill(session_id)).await?;
        let (shutdown, _) = watch::channel(false);

        info!(
            session_id,
            connect_code = %record.connect_code,
            generation,
            "session loop started"
        );
        let event_loop = Self {
            session_id: session_id.to_string(),
            connect_code: record.connect_code.clone(),
            queue,
            generation,
            shutdown,
            runtime,
        };
        Ok(tokio::spawn(event_loop.run(notify, kill)))
    }

    async fn run(
        self,
        mut notify: BoxStream<'static, String>,
        mut kill: BoxStream<'static, String>,
    ) -> StopReason {
        if let Err(err) = self.queue.ack().await {
            warn!(connect_code = %self.connect_code, error = %err, "failed to announce listener");
        }

        let inactivity = self.runtime.config().inactivity_timeout;
        let mut deadline = Instant::now() + inactivity;
        let reason = match self.drain(&mut deadline).await {
            Some(reason) => reason,
            None => loop {
                tokio::select! {
                    message = notify.next() => match message {
                        Some(_) => {
                            if let Some(reason) = self.check_ownership().await {
                                break reason;
                            }
                            if let Some(reason) = self.drain(&mut deadline).await {
                                break reason;
                            }
                        }
                        None => break StopReason::ChannelClosed,
                    },
                    _ = kill.next() => break StopReason::Killed,
                    _ = sleep_until(deadline) => break StopReason::Inactive,
                }
            },
        };

        self.teardown(reason).await;
        reason
    }

    /// Stop before touching the queue once another loop owns the session.
    async fn check_ownership(&self) -> Option<StopReason> {
        match self.runtime.store().get_session(&self.session_id).await {
            Ok(Some(record)) if record.consumer_generation == self.generation => None,
            Ok(Some(_)) => Some(StopReason::Superseded),
            Ok(None) => Some(StopReason::Gone),
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "ownership check failed");
                None
            }
        }
    }

    /// Handle queued jobs until the queue is empty.
    async fn drain(&self, deadline: &mut Instant) -> Option<StopReason> {
        loop {
            match self.queue.pop().await {
                Ok(job) => {
                    *deadline = Instant::now() + self.runtime.config().inactivity_timeout;
                    match self.handle_job(job).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop(reason)) => return Some(reason),
                        Err(err) => warn!(
                            session_id = %self.session_id,
                            error = %err,
                            "job handling failed"
                        ),
                    }
                }
                Err(QueueError::Empty) => return None,
                Err(QueueError::Decode(_)) => continue,
                Err(err) => {
                    warn!(connect_code = %self.connect_code, error = %err, "queue read failed");
                    return None;
                }
            }
        }
    }

    async fn handle_job(&self, job: Job) -> Result<Flow, ServiceError> {
        debug!(connect_code = %self.connect_code, kind = ?job.kind(), "handling job");
        match job {
            Job::Connection(linked) => self.on_connection(linked).await,
            Job::Lobby(lobby) => self.on_lobby(lobby).await,
            Job::State(phase) => self.on_phase(phase).await,
            Job::Player(update) => self.on_player(update).await,
            Job::GameOver(result) => self.on_game_over(result).await,
        }
    }

    /// Lock and load the record, or report why this loop has to stop.
    async fn acquire(&self) -> Result<Result<(SessionRecord, SessionLock), StopReason>, ServiceError> {
        let store = self.runtime.store();
        let Some((record, lock)) =
            lock_and_load(store, &self.session_id, self.runtime.retry_policy()).await?
        else {
            return Ok(Err(StopReason::Gone));
        };
        if record.consumer_generation != self.generation {
            store.release_session_lock(lock).await?;
            return Ok(Err(StopReason::Superseded));
        }
        Ok(Ok((record, lock)))
    }

    async fn on_connection(&self, linked: bool) -> Result<Flow, ServiceError> {
        let (mut record, lock) = match self.acquire().await? {
            Ok(owned) => owned,
            Err(reason) => return Ok(Flow::Stop(reason)),
        };
        record.linked = linked;
        let origin = if linked {
            None
        } else {
            let origin = record.game.update_phase(Phase::Menu);
            (origin != Phase::Menu).then_some(origin)
        };
        self.runtime.store().put_session(&record, Some(lock)).await?;
        info!(connect_code = %self.connect_code, linked, "capture client link changed");

        self.runtime.refresh(&record);
        if let Some(origin) = origin {
            self.schedule_voice(&record, origin, Phase::Menu).await;
        }
        Ok(Flow::Continue)
    }

    async fn on_lobby(&self, lobby: LobbyPayload) -> Result<Flow, ServiceError> {
        let (mut record, lock) = match self.acquire().await? {
            Ok(owned) => owned,
            Err(reason) => return Ok(Flow::Stop(reason)),
        };
        record
            .game
            .set_lobby(lobby.lobby_code.clone(), lobby.region_name(), lobby.game_map());
        self.runtime.store().put_session(&record, Some(lock)).await?;
        self.runtime.refresh(&record);
        Ok(Flow::Continue)
    }

    async fn on_phase(&self, phase: Phase) -> Result<Flow, ServiceError> {
        let (mut record, lock) = match self.acquire().await? {
            Ok(owned) => owned,
            Err(reason) => return Ok(Flow::Stop(reason)),
        };
        let store = self.runtime.store();
        let origin = record.game.update_phase(phase);
        if origin == phase {
            store.release_session_lock(lock).await?;
            return Ok(Flow::Continue);
        }

        let started = (origin == Phase::Lobby && phase == Phase::Tasks).then(|| {
            let match_id = rand::rng().random_range(1..i64::MAX);
            let start_unix = time::OffsetDateTime::now_utc().unix_timestamp();
            record.start_match(match_id, start_unix);
            (match_id, start_unix)
        });
        store.put_session(&record, Some(lock)).await?;
        info!(
            connect_code = %self.connect_code,
            from = %origin,
            to = %phase,
            "phase changed"
        );

        if let Some((match_id, start_unix)) = started {
            tokio::spawn(self.runtime.collaborators().stats.match_started(
                &record.guild_id,
                &record.connect_code,
                match_id,
                start_unix,
            ));
        }
        self.runtime.refresh(&record);
        self.schedule_voice(&record, origin, phase).await;
        Ok(Flow::Continue)
    }

    async fn on_player(&self, update: PlayerUpdate) -> Result<Flow, ServiceError> {
        if !is_valid_color(update.color) {
            debug!(
                connect_code = %self.connect_code,
                name = %update.name,
                color = update.color,
                "ignoring player with an invalid color"
            );
            return Ok(Flow::Continue);
        }
        let (mut record, lock) = match self.acquire().await? {
            Ok(owned) => owned,
            Err(reason) => return Ok(Flow::Stop(reason)),
        };
        let store = self.runtime.store();

        if update.disconnected || update.action == PlayerAction::Disconnected {
            let unlinked = record.unlink_player(&update.name);
            record.game.remove_player(&update.name);
            store.put_session(&record, Some(lock)).await?;
            debug!(
                connect_code = %self.connect_code,
                name = %update.name,
                unlinked = ?unlinked,
                "player disconnected"
            );
            if record.game.phase != Phase::Tasks {
                self.runtime.refresh(&record);
            }
            return Ok(Flow::Continue);
        }

        let change = record.game.update_player(&update);
        if !change.changed {
            store.release_session_lock(lock).await?;
            return Ok(Flow::Continue);
        }
        let newly_linked = if record.user_for_player(&update.name).is_none() {
            self.pair(&mut record, &update.name).await
        } else {
            None
        };
        store.put_session(&record, Some(lock)).await?;

        if let Some(user_id) = &newly_linked {
            info!(connect_code = %self.connect_code, name = %update.name, %user_id, "player linked");
            if let Err(err) = store
                .remember_name(&record.guild_id, &update.name, user_id)
                .await
            {
                warn!(error = %err, "failed to cache player name");
            }
        }

        let settings = self.runtime.settings(&record.guild_id).await;
        let phase = record.game.phase;
        if suppresses_voice_update(phase, update.action, change.alive_changed, &settings) {
            debug!(connect_code = %self.connect_code, name = %update.name, "death kept hidden until the next phase");
            return Ok(Flow::Continue);
        }
        self.runtime.refresh(&record);
        if change.alive_changed || newly_linked.is_some() {
            self.schedule_voice(&record, phase, phase).await;
        }
        Ok(Flow::Continue)
    }

    async fn on_game_over(&self, result: GameOverPayload) -> Result<Flow, ServiceError> {
        let store = self.runtime.store();
        let Some(snapshot) = store.get_session(&self.session_id).await? else {
            return Ok(Flow::Stop(StopReason::Gone));
        };
        let collaborators = self.runtime.collaborators();
        collaborators
            .presentation
            .game_over(&SessionSummary::from(&snapshot), &result);
        if snapshot.match_in_progress() {
            tokio::spawn(collaborators.stats.match_ended(
                &snapshot.guild_id,
                snapshot.match_id,
                &result,
            ));
        }

        let (mut record, lock) = match self.acquire().await? {
            Ok(owned) => owned,
            Err(reason) => return Ok(Flow::Stop(reason)),
        };
        record.clear_match();
        store.put_session(&record, Some(lock)).await?;
        Ok(Flow::Continue)
    }

    /// Link a new player by voice names first, then by the name cache.
    async fn pair(&self, record: &mut SessionRecord, player_name: &str) -> Option<String> {
        let members: Vec<_> = self
            .runtime
            .collaborators()
            .roster
            .voice_members(&record.guild_id)
            .await
            .into_iter()
            .filter(|member| is_tracked(record, member))
            .collect();
        if let Some(user_id) = pair_by_matching_names(record, player_name, &members) {
            return Some(user_id);
        }

        match self
            .runtime
            .store()
            .name_candidates(&record.guild_id, player_name)
            .await
        {
            Ok(candidates) => pair_by_user_ids(record, player_name, &candidates),
            Err(err) => {
                warn!(error = %err, "name cache lookup failed");
                None
            }
        }
    }

    async fn schedule_voice(&self, record: &SessionRecord, origin: Phase, dest: Phase) {
        match self
            .runtime
            .schedule_voice_update(record, origin, dest, self.shutdown.subscribe())
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(
                connect_code = %self.connect_code,
                "voice batch in flight; folding update into it"
            ),
            Err(err) => warn!(connect_code = %self.connect_code, error = %err, "voice update not scheduled"),
        }
    }

    /// Release everything the session holds, unless a newer loop owns it.
    async fn teardown(&self, reason: StopReason) {
        let _ = self.shutdown.send(true);
        if reason == StopReason::Superseded {
            info!(session_id = %self.session_id, "newer consumer owns the session");
            return;
        }

        let store = self.runtime.store();
        match store.get_session(&self.session_id).await {
            Ok(Some(record)) if record.consumer_generation == self.generation => {
                let report = self.runtime.restore_voice(&record).await;
                debug!(
                    session_id = %self.session_id,
                    restored = report.counts.applied(),
                    "voice restored"
                );
                if let Err(err) = store.delete_session(&self.session_id).await {
                    warn!(session_id = %self.session_id, error = %err, "failed to delete session");
                }
            }
            Ok(Some(_)) => {
                info!(session_id = %self.session_id, "session claimed by a newer consumer");
                return;
            }
            Ok(None) => {}
            Err(err) => warn!(session_id = %self.session_id, error = %err, "failed to load session for teardown"),
        }

        if let Err(err) = self.queue.clear().await {
            warn!(connect_code = %self.connect_code, error = %err, "failed to clear queue");
        }
        info!(
            session_id = %self.session_id,
            connect_code = %self.connect_code,
            reason = ?reason,
            "session loop stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::{FutureExt, future::BoxFuture};

    use super::*;
    use crate::{
        config::AppConfig,
        dao::shared_store::{MemoryBackend, SharedStateStore},
        services::{
            collaborators::{
                ApiError, Collaborators, IdentityClient, InMemoryVoiceRoster, VoiceMember,
            },
            identity_pool::IdentityPool,
            mute_dispatcher::MuteDispatcher,
        },
        state::session::NO_MATCH,
    };

    /// Primary identity whose mutes land in the shared roster.
    struct RosterIdentity {
        roster: Arc<InMemoryVoiceRoster>,
        calls: AtomicUsize,
    }

    impl IdentityClient for RosterIdentity {
        fn id(&self) -> &str {
            "primary"
        }

        fn set_voice_state(
            &self,
            guild_id: &str,
            user_id: &str,
            mute: bool,
            deaf: bool,
        ) -> BoxFuture<'static, Result<(), ApiError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.roster.apply_voice_state(guild_id, user_id, mute, deaf);
            futures::future::ready(Ok(())).boxed()
        }

        fn is_guild_member(&self, _guild_id: &str) -> BoxFuture<'static, Result<bool, ApiError>> {
            futures::future::ready(Ok(true)).boxed()
        }

        fn leave_guild(&self, _guild_id: &str) -> BoxFuture<'static, Result<(), ApiError>> {
            futures::future::ready(Ok(())).boxed()
        }
    }

    struct Harness {
        runtime: Arc<SessionRuntime>,
        roster: Arc<InMemoryVoiceRoster>,
        primary: Arc<RosterIdentity>,
        record: SessionRecord,
    }

    impl Harness {
        async fn new(config: AppConfig) -> Self {
            let config = Arc::new(config);
            let store = SharedStateStore::new(Arc::new(MemoryBackend::new()), config.session_lock_lease);
            let roster = Arc::new(InMemoryVoiceRoster::new());
            let primary = Arc::new(RosterIdentity {
                roster: Arc::clone(&roster),
                calls: AtomicUsize::new(0),
            });
            let mut collaborators = Collaborators::logging(&config);
            collaborators.roster = roster.clone();
            let pool = IdentityPool::new(
                store.clone(),
                &config,
                Some(primary.clone() as Arc<dyn IdentityClient>),
                Vec::new(),
            );
            let dispatcher = Arc::new(MuteDispatcher::new(
                Arc::new(pool),
                store.clone(),
                collaborators.metrics.clone(),
                &config,
            ));
            let runtime = SessionRuntime::new(store.clone(), dispatcher, collaborators, config);

            let record = SessionRecord::new("guild", "CODE", "text", "voice");
            store.put_session(&record, None).await.unwrap();
            for (user_id, nick) in [("u-red", "Red"), ("u-blue", "Blue")] {
                roster.upsert(
                    "guild",
                    VoiceMember {
                        user_id: user_id.into(),
                        username: format!("{user_id}-account"),
                        nick: Some(nick.into()),
                        channel_id: "voice".into(),
                        mute: false,
                        deaf: false,
                    },
                );
            }
            Self {
                runtime,
                roster,
                primary,
                record,
            }
        }

        fn queue(&self) -> EventQueue {
            self.runtime.queue(&self.record.connect_code)
        }

        async fn push(&self, jobs: Vec<Job>) {
            let queue = self.queue();
            for job in jobs {
                queue.push_job(&job).await.unwrap();
            }
        }

        async fn record(&self) -> Option<SessionRecord> {
            self.runtime
                .store()
                .get_session(&self.record.session_id)
                .await
                .unwrap()
        }

        fn muted(&self, user_id: &str) -> bool {
            self.roster
                .member("guild", user_id)
                .is_some_and(|member| member.mute)
        }
    }

    fn join(name: &str, color: i32) -> Job {
        Job::Player(PlayerUpdate {
            action: PlayerAction::Joined,
            name: name.into(),
            color,
            is_dead: false,
            disconnected: false,
        })
    }

    fn player(name: &str, color: i32, action: PlayerAction, is_dead: bool) -> Job {
        Job::Player(PlayerUpdate {
            action,
            name: name.into(),
            color,
            is_dead,
            disconnected: false,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_phase_mutes_linked_alive_players() {
        let harness = Harness::new(AppConfig::default()).await;
        let handle = SessionEventLoop::spawn(harness.runtime.clone(), &harness.record.session_id)
            .await
            .unwrap();

        harness
            .push(vec![
                Job::State(Phase::Lobby),
                join("Red", 0),
                join("Blue", 1),
                Job::State(Phase::Tasks),
            ])
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let record = harness.record().await.unwrap();
        assert_eq!(record.game.phase, Phase::Tasks);
        assert_ne!(record.match_id, NO_MATCH);
        assert_eq!(record.user_for_player("red"), Some("u-red"));
        assert!(record.linkage["u-blue"].desired_mute);
        assert!(harness.muted("u-red"));
        assert!(harness.muted("u-blue"));
        assert!(!handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn deaths_during_tasks_wait_for_discussion() {
        let harness = Harness::new(AppConfig::default()).await;
        SessionEventLoop::spawn(harness.runtime.clone(), &harness.record.session_id)
            .await
            .unwrap();
        harness
            .push(vec![
                Job::State(Phase::Lobby),
                join("Red", 0),
                join("Blue", 1),
                Job::State(Phase::Tasks),
            ])
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        let calls_before = harness.primary.calls.load(Ordering::SeqCst);

        harness
            .push(vec![player("Blue", 1, PlayerAction::Died, true)])
            .await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(harness.primary.calls.load(Ordering::SeqCst), calls_before);

        harness.push(vec![Job::State(Phase::Discuss)]).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!harness.muted("u-red"));
        assert!(harness.muted("u-blue"));
    }

    #[tokio::test(start_paused = true)]
    async fn kill_restores_voice_and_deletes_the_session() {
        let harness = Harness::new(AppConfig::default()).await;
        let handle = SessionEventLoop::spawn(harness.runtime.clone(), &harness.record.session_id)
            .await
            .unwrap();
        harness
            .push(vec![
                Job::State(Phase::Lobby),
                join("Red", 0),
                Job::State(Phase::Tasks),
            ])
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(harness.muted("u-red"));

        harness
            .runtime
            .store()
            .publish(keys::kill(&harness.record.session_id), "kill".into())
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), StopReason::Killed);
        assert!(!harness.muted("u-red"));
        assert!(harness.record().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_ends_the_session() {
        let mut config = AppConfig::default();
        config.inactivity_timeout = Duration::from_secs(60);
        let harness = Harness::new(config).await;
        let handle = SessionEventLoop::spawn(harness.runtime.clone(), &harness.record.session_id)
            .await
            .unwrap();

        assert_eq!(handle.await.unwrap(), StopReason::Inactive);
        assert!(harness.record().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn a_newer_consumer_supersedes_the_old_loop() {
        let harness = Harness::new(AppConfig::default()).await;
        let old = SessionEventLoop::spawn(harness.runtime.clone(), &harness.record.session_id)
            .await
            .unwrap();
        let new = SessionEventLoop::spawn(harness.runtime.clone(), &harness.record.session_id)
            .await
            .unwrap();

        harness.push(vec![Job::State(Phase::Lobby)]).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(old.is_finished());
        assert_eq!(old.await.unwrap(), StopReason::Superseded);
        assert!(!new.is_finished());
        let record = harness.record().await.unwrap();
        assert_eq!(record.consumer_generation, 2);
        assert_eq!(record.game.phase, Phase::Lobby);
    }

    #[tokio::test(start_paused = true)]
    async fn game_over_clears_the_match() {
        let harness = Harness::new(AppConfig::default()).await;
        SessionEventLoop::spawn(harness.runtime.clone(), &harness.record.session_id)
            .await
            .unwrap();
        harness
            .push(vec![
                Job::State(Phase::Lobby),
                Job::State(Phase::Tasks),
                Job::GameOver(GameOverPayload {
                    reason: 0,
                    player_infos: Vec::new(),
                }),
            ])
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let record = harness.record().await.unwrap();
        assert!(!record.match_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn capture_disconnect_returns_to_menu_and_invalid_colors_are_ignored() {
        let harness = Harness::new(AppConfig::default()).await;
        SessionEventLoop::spawn(harness.runtime.clone(), &harness.record.session_id)
            .await
            .unwrap();
        harness
            .push(vec![
                Job::Connection(true),
                Job::State(Phase::Lobby),
                join("Ghost", 42),
                Job::Connection(false),
            ])
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let record = harness.record().await.unwrap();
        assert!(!record.linked);
        assert_eq!(record.game.phase, Phase::Menu);
        assert!(record.game.players.is_empty());
    }
}
