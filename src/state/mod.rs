pub mod game;
pub mod player;
pub mod rules;
pub mod session;

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    config::AppConfig,
    dao::shared_store::{SharedStateStore, StoreBackend},
    error::ServiceError,
    services::{
        collaborators::{Collaborators, IdentityClient, InMemoryVoiceRoster},
        identity_pool::IdentityPool,
        mute_dispatcher::MuteDispatcher,
        runtime::SessionRuntime,
        sse_service::EventHub,
    },
};

pub type SharedState = Arc<AppState>;

/// Capacity of the session SSE broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Central application state: configuration, session engine and the degraded flag.
pub struct AppState {
    config: Arc<AppConfig>,
    runtime: Arc<SessionRuntime>,
    events: Arc<EventHub>,
    /// Roster fed through the voice presence routes; `None` when an external
    /// roster is wired in.
    voice_presence: Option<Arc<InMemoryVoiceRoster>>,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// Wire the session engine with logging collaborators, the SSE presentation
    /// and a roster fed through the voice presence routes.
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn StoreBackend>,
        primary: Option<Arc<dyn IdentityClient>>,
        secondaries: Vec<Arc<dyn IdentityClient>>,
    ) -> SharedState {
        let events = Arc::new(EventHub::new(EVENT_CAPACITY));
        let roster = Arc::new(InMemoryVoiceRoster::new());
        let mut collaborators = Collaborators::logging(&config);
        collaborators.presentation = events.clone();
        collaborators.roster = roster.clone();
        Self::assemble(
            config,
            backend,
            (primary, secondaries),
            collaborators,
            events,
            Some(roster),
        )
    }

    /// Wire the session engine around explicit collaborators.
    pub fn with_collaborators(
        config: AppConfig,
        backend: Arc<dyn StoreBackend>,
        primary: Option<Arc<dyn IdentityClient>>,
        secondaries: Vec<Arc<dyn IdentityClient>>,
        collaborators: Collaborators,
        events: Arc<EventHub>,
    ) -> SharedState {
        Self::assemble(
            config,
            backend,
            (primary, secondaries),
            collaborators,
            events,
            None,
        )
    }

    fn assemble(
        config: AppConfig,
        backend: Arc<dyn StoreBackend>,
        (primary, secondaries): (Option<Arc<dyn IdentityClient>>, Vec<Arc<dyn IdentityClient>>),
        collaborators: Collaborators,
        events: Arc<EventHub>,
        voice_presence: Option<Arc<InMemoryVoiceRoster>>,
    ) -> SharedState {
        let config = Arc::new(config);
        let store = SharedStateStore::new(backend, config.session_lock_lease);
        let pool = IdentityPool::new(store.clone(), &config, primary, secondaries);
        let dispatcher = Arc::new(MuteDispatcher::new(
            Arc::new(pool),
            store.clone(),
            collaborators.metrics.clone(),
            &config,
        ));
        let runtime = SessionRuntime::new(store, dispatcher, collaborators, config.clone());
        let (degraded_tx, _rx) = watch::channel(false);

        Arc::new(Self {
            config,
            runtime,
            events,
            voice_presence,
            degraded: degraded_tx,
        })
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    /// Session engine shared by loops and admin commands.
    pub fn runtime(&self) -> &Arc<SessionRuntime> {
        &self.runtime
    }

    pub fn store(&self) -> &SharedStateStore {
        self.runtime.store()
    }

    /// Broadcast hub used for the session SSE stream.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Roster accepting presence updates over HTTP, when this process owns it.
    pub fn voice_presence(&self) -> Option<&Arc<InMemoryVoiceRoster>> {
        self.voice_presence.as_ref()
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Fail fast while the store is unhealthy.
    pub fn require_store(&self) -> Result<&SharedStateStore, ServiceError> {
        if self.is_degraded() {
            return Err(ServiceError::Degraded);
        }
        Ok(self.store())
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        let changed = self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
        if changed {
            self.events.broadcast_status(value);
        }
    }
}
