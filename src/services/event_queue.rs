use std::time::Duration;

use futures::stream::BoxStream;
use thiserror::Error;
use tracing::debug;

use crate::{
    dao::{
        keys,
        shared_store::SharedStateStore,
        storage::StoreError,
    },
    dto::job::{Job, JobDecodeError, JobEnvelope},
};

/// Message published on the liveness channel once a consumer is listening.
pub const LISTENING: &str = "listening";
/// Message published on the notify channel after every push.
const NEW_DATA: &str = "new";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,
    /// The popped entry was dropped.
    #[error(transparent)]
    Decode(#[from] JobDecodeError),
    #[error("failed to encode job: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// FIFO of capture jobs for one session, with notify and liveness channels.
#[derive(Clone)]
pub struct EventQueue {
    store: SharedStateStore,
    connect_code: String,
    ttl: Duration,
}

impl EventQueue {
    pub fn new(store: SharedStateStore, connect_code: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            connect_code: connect_code.into(),
            ttl,
        }
    }

    pub fn connect_code(&self) -> &str {
        &self.connect_code
    }

    /// Append an envelope and wake the consumer. The first push on an empty
    /// queue arms its TTL so abandoned queues clean themselves up.
    pub async fn push(&self, envelope: &JobEnvelope) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(envelope).map_err(QueueError::Encode)?;
        let key = keys::queue(&self.connect_code);
        let len = self.store.backend().push_back(key.clone(), encoded).await?;
        if len == 1 {
            self.store.backend().expire(key, self.ttl).await?;
        }
        self.store
            .publish(keys::queue_notify(&self.connect_code), NEW_DATA.to_string())
            .await?;
        Ok(())
    }

    /// Encode and append a decoded job.
    pub async fn push_job(&self, job: &Job) -> Result<(), QueueError> {
        let envelope = job.to_envelope().map_err(QueueError::Encode)?;
        self.push(&envelope).await
    }

    /// Pop the oldest job without blocking.
    pub async fn pop(&self) -> Result<Job, QueueError> {
        let raw = self
            .store
            .backend()
            .pop_front(keys::queue(&self.connect_code))
            .await?
            .ok_or(QueueError::Empty)?;
        Job::from_json_str(&raw).map_err(|err| {
            debug!(connect_code = %self.connect_code, error = %err, "dropping malformed job");
            QueueError::Decode(err)
        })
    }

    /// Tell the producer a consumer is listening.
    pub async fn ack(&self) -> Result<usize, QueueError> {
        Ok(self
            .store
            .publish(keys::queue_ack(&self.connect_code), LISTENING.to_string())
            .await?)
    }

    pub async fn subscribe_notify(&self) -> Result<BoxStream<'static, String>, QueueError> {
        Ok(self
            .store
            .subscribe(keys::queue_notify(&self.connect_code))
            .await?)
    }

    pub async fn subscribe_ack(&self) -> Result<BoxStream<'static, String>, QueueError> {
        Ok(self
            .store
            .subscribe(keys::queue_ack(&self.connect_code))
            .await?)
    }

    /// Drop every pending job.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.store
            .backend()
            .delete(keys::queue(&self.connect_code))
            .await?;
        Ok(())
    }
}
