//! Fan a change-set out over a bounded worker pool, trying each change through
//! an ordered chain: secondary identity, capture client, primary identity.

use std::{collections::HashSet, sync::Arc, time::Duration};

use futures::StreamExt;
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::{
        keys,
        shared_store::SharedStateStore,
        storage::StoreError,
    },
    dto::job::ModifyTask,
    services::{
        collaborators::{ApiError, MetricsSink, OutcomeCounts},
        identity_pool::{IdentityPool, capture_identity_id},
        voice_service::VoiceChange,
    },
};

/// Why a change could not be applied.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("identity `{identity}` failed: {source}")]
    Api {
        identity: String,
        #[source]
        source: ApiError,
    },
    #[error("no primary identity configured")]
    NoPrimary,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Links of the fallback chain, tried in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Secondary,
    Capture,
    Primary,
}

impl Strategy {
    pub const CHAIN: [Strategy; 3] = [Strategy::Secondary, Strategy::Capture, Strategy::Primary];
}

/// Which link applied a change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Worker(String),
    Capture,
    Official,
}

/// Result of one link of the chain.
#[derive(Debug)]
pub enum Attempt {
    Applied(Outcome),
    /// Try the next link.
    Skip,
    /// Try the next link; this one was out of rate budget.
    RateLimited,
    /// Stop; nothing further can apply the change.
    Failed(DispatchError),
}

/// One change-set to apply for one session.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub guild_id: String,
    /// Capture client code; empty disables the capture link.
    pub connect_code: String,
    pub changes: Vec<VoiceChange>,
    /// Secondary identities this guild may use.
    pub secondary_budget: usize,
}

/// Aggregated outcome of a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub counts: OutcomeCounts,
    /// Changes that were applied, with the link that applied them.
    pub applied: Vec<(VoiceChange, Outcome)>,
    pub last_error: Option<String>,
}

struct BatchContext {
    guild_id: String,
    connect_code: String,
    budget: usize,
    used: Mutex<HashSet<String>>,
    report: Mutex<BatchReport>,
}

impl BatchContext {
    async fn note_error(&self, err: &DispatchError) {
        self.report.lock().await.last_error = Some(err.to_string());
    }
}

/// Applies voice change-sets through the identity chain.
pub struct MuteDispatcher {
    pool: Arc<IdentityPool>,
    store: SharedStateStore,
    metrics: Arc<dyn MetricsSink>,
    workers: usize,
    capture_ack_timeout: Duration,
}

impl MuteDispatcher {
    pub fn new(
        pool: Arc<IdentityPool>,
        store: SharedStateStore,
        metrics: Arc<dyn MetricsSink>,
        config: &AppConfig,
    ) -> Self {
        Self {
            pool,
            store,
            metrics,
            workers: config.dispatch_workers.max(1),
            capture_ack_timeout: config.capture_ack_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<IdentityPool> {
        &self.pool
    }

    /// Apply every change of `request`, at most `workers` at a time.
    ///
    /// Changes are handed out in order, so a prioritized batch starts with its
    /// most urgent entries.
    pub async fn dispatch(self: &Arc<Self>, request: DispatchRequest) -> BatchReport {
        if request.changes.is_empty() {
            return BatchReport::default();
        }

        let worker_count = self.workers.min(request.changes.len());
        let (tx, rx) = mpsc::channel(request.changes.len());
        for change in request.changes {
            // capacity covers the whole batch
            let _ = tx.try_send(change);
        }
        drop(tx);
        let rx = Arc::new(Mutex::new(rx));

        let context = Arc::new(BatchContext {
            guild_id: request.guild_id,
            connect_code: request.connect_code,
            budget: request.secondary_budget,
            used: Mutex::new(HashSet::new()),
            report: Mutex::new(BatchReport::default()),
        });

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let dispatcher = Arc::clone(self);
            let context = Arc::clone(&context);
            let rx = Arc::clone(&rx);
            workers.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(change) = next else {
                        break;
                    };
                    dispatcher.apply(&context, change).await;
                }
            });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "mute worker panicked");
            }
        }

        let report = context.report.lock().await.clone();
        self.metrics.record_batch(&context.guild_id, &report.counts);

        if context.budget > 0 && !self.pool.secondaries().is_empty() {
            tokio::spawn(enforce_secondary_budget(
                Arc::clone(&self.pool),
                context.guild_id.clone(),
                context.budget,
            ));
        }
        report
    }

    async fn apply(&self, context: &BatchContext, change: VoiceChange) {
        let mut rate_limited = false;
        let mut applied = None;
        for strategy in Strategy::CHAIN {
            match self.attempt(strategy, context, &change).await {
                Attempt::Applied(outcome) => {
                    applied = Some(outcome);
                    break;
                }
                Attempt::Skip => continue,
                Attempt::RateLimited => rate_limited = true,
                Attempt::Failed(err) => {
                    warn!(
                        guild_id = %context.guild_id,
                        user_id = %change.user_id,
                        error = %err,
                        "voice change could not be applied"
                    );
                    context.note_error(&err).await;
                    break;
                }
            }
        }

        let mut report = context.report.lock().await;
        if rate_limited {
            report.counts.rate_limited += 1;
        }
        match applied {
            Some(outcome) => {
                match &outcome {
                    Outcome::Worker(_) => report.counts.worker += 1,
                    Outcome::Capture => report.counts.capture += 1,
                    Outcome::Official => report.counts.official += 1,
                }
                report.applied.push((change, outcome));
            }
            None => report.counts.failed += 1,
        }
    }

    /// Run a single link of the chain for one change.
    async fn attempt(
        &self,
        strategy: Strategy,
        context: &BatchContext,
        change: &VoiceChange,
    ) -> Attempt {
        match strategy {
            Strategy::Secondary => self.try_secondaries(context, change).await,
            Strategy::Capture => self.try_capture(context, change).await,
            Strategy::Primary => self.try_primary(context, change).await,
        }
    }

    async fn try_secondaries(&self, context: &BatchContext, change: &VoiceChange) -> Attempt {
        if context.budget == 0 {
            return Attempt::Skip;
        }
        let candidates = {
            let used = context.used.lock().await;
            self.pool.candidates(&used, context.budget)
        };

        let mut rate_limited = false;
        for identity in candidates {
            match self.pool.try_reserve(&context.guild_id, identity.id()).await {
                Ok(true) => {}
                Ok(false) => {
                    rate_limited = true;
                    continue;
                }
                Err(err) => {
                    context.note_error(&DispatchError::from(err)).await;
                    continue;
                }
            }

            match identity
                .set_voice_state(&context.guild_id, &change.user_id, change.mute, change.deaf)
                .await
            {
                Ok(()) => {
                    context
                        .used
                        .lock()
                        .await
                        .insert(identity.id().to_string());
                    return Attempt::Applied(Outcome::Worker(identity.id().to_string()));
                }
                Err(source) => {
                    self.pool.blacklist(&context.guild_id, identity.id()).await;
                    context
                        .note_error(&DispatchError::Api {
                            identity: identity.id().to_string(),
                            source,
                        })
                        .await;
                }
            }
        }
        if rate_limited {
            Attempt::RateLimited
        } else {
            Attempt::Skip
        }
    }

    async fn try_capture(&self, context: &BatchContext, change: &VoiceChange) -> Attempt {
        if context.connect_code.is_empty() {
            return Attempt::Skip;
        }
        let capture_id = capture_identity_id(&context.connect_code);
        match self.pool.try_reserve(&context.guild_id, &capture_id).await {
            Ok(true) => {}
            Ok(false) => return Attempt::RateLimited,
            Err(err) => {
                context.note_error(&DispatchError::from(err)).await;
                return Attempt::Skip;
            }
        }

        match self.capture_round_trip(context, change).await {
            Ok(true) => Attempt::Applied(Outcome::Capture),
            Ok(false) => {
                debug!(
                    connect_code = %context.connect_code,
                    user_id = %change.user_id,
                    "capture client did not acknowledge"
                );
                self.pool.blacklist(&context.guild_id, &capture_id).await;
                Attempt::Skip
            }
            Err(err) => {
                context.note_error(&DispatchError::from(err)).await;
                Attempt::Skip
            }
        }
    }

    /// Publish a modify task and wait for a positive acknowledgement.
    async fn capture_round_trip(
        &self,
        context: &BatchContext,
        change: &VoiceChange,
    ) -> Result<bool, StoreError> {
        let task = ModifyTask {
            task_id: Uuid::new_v4().to_string(),
            guild_id: context.guild_id.clone(),
            user_id: change.user_id.clone(),
            mute: change.mute,
            deaf: change.deaf,
        };
        let channel = keys::tasks(&context.connect_code);
        let encoded = serde_json::to_string(&task).map_err(|source| StoreError::Serialization {
            key: channel.clone(),
            source,
        })?;

        let mut acks = self
            .store
            .subscribe(keys::task_ack(&context.connect_code, &task.task_id))
            .await?;
        if self.store.publish(channel, encoded).await? == 0 {
            return Ok(false);
        }

        match timeout(self.capture_ack_timeout, acks.next()).await {
            Ok(Some(ack)) => Ok(ack.trim() == "true"),
            Ok(None) | Err(_) => Ok(false),
        }
    }

    async fn try_primary(&self, context: &BatchContext, change: &VoiceChange) -> Attempt {
        let Some(primary) = self.pool.primary() else {
            return Attempt::Failed(DispatchError::NoPrimary);
        };
        match primary
            .set_voice_state(&context.guild_id, &change.user_id, change.mute, change.deaf)
            .await
        {
            Ok(()) => Attempt::Applied(Outcome::Official),
            Err(source) => Attempt::Failed(DispatchError::Api {
                identity: primary.id().to_string(),
                source,
            }),
        }
    }
}

/// Leave guilds where more secondary identities are present than the budget allows.
async fn enforce_secondary_budget(pool: Arc<IdentityPool>, guild_id: String, budget: usize) {
    let mut confirmed = 0usize;
    for identity in pool.secondaries() {
        match identity.is_guild_member(&guild_id).await {
            Ok(true) => {
                confirmed += 1;
                if confirmed > budget {
                    match identity.leave_guild(&guild_id).await {
                        Ok(()) => info!(
                            %guild_id,
                            identity = identity.id(),
                            budget,
                            "left guild above secondary budget"
                        ),
                        Err(err) => warn!(
                            %guild_id,
                            identity = identity.id(),
                            error = %err,
                            "failed to leave guild above secondary budget"
                        ),
                    }
                }
            }
            Ok(false) => {}
            Err(err) => debug!(
                %guild_id,
                identity = identity.id(),
                error = %err,
                "membership check failed"
            ),
        }
    }
}
