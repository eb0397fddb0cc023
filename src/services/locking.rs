use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::{
    config::AppConfig,
    dao::{
        shared_store::{SessionLock, SharedStateStore},
        storage::StoreResult,
    },
    state::session::SessionRecord,
};

/// Backoff used while another holder owns a session lock.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    initial: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    fn initial_delay(&self) -> Duration {
        self.initial
    }

    fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self::new(config.lock_backoff_initial, config.lock_backoff_max)
    }
}

/// Take the session lock, waiting as long as it is held elsewhere.
///
/// Contention never gives up: a crashed holder's lease expires eventually.
/// Store failures are returned.
pub async fn lock_session(
    store: &SharedStateStore,
    session_id: &str,
    policy: RetryPolicy,
) -> StoreResult<SessionLock> {
    let mut delay = policy.initial_delay();
    let mut attempts = 0u32;
    loop {
        if let Some(lock) = store.acquire_session_lock(session_id).await? {
            if attempts > 1 {
                debug!(session_id, attempts, "session lock acquired after contention");
            }
            return Ok(lock);
        }
        attempts += 1;
        sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}

/// Lock a session and load its record.
///
/// A missing record releases the lock and yields `None`.
pub async fn lock_and_load(
    store: &SharedStateStore,
    session_id: &str,
    policy: RetryPolicy,
) -> StoreResult<Option<(SessionRecord, SessionLock)>> {
    let lock = lock_session(store, session_id, policy).await?;
    match store.get_session(session_id).await {
        Ok(Some(record)) => Ok(Some((record, lock))),
        Ok(None) => {
            store.release_session_lock(lock).await?;
            Ok(None)
        }
        Err(err) => {
            store.release_session_lock(lock).await?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::dao::shared_store::MemoryBackend;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(80))
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = policy();
        let mut delay = policy.initial_delay();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(delay.as_millis());
            delay = policy.next_delay(delay);
        }
        assert_eq!(seen, [10, 20, 40, 80, 80]);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_current_holder() {
        let store = SharedStateStore::new(Arc::new(MemoryBackend::new()), Duration::from_secs(5));
        let record = SessionRecord::new("g", "CODE", "t", "v");
        store.put_session(&record, None).await.unwrap();
        let held = store
            .acquire_session_lock(&record.session_id)
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let store = store.clone();
            let session_id = record.session_id.clone();
            tokio::spawn(async move { lock_and_load(&store, &session_id, policy()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        store.release_session_lock(held).await.unwrap();
        let (loaded, lock) = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(loaded, record);
        store.put_session(&loaded, Some(lock)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_records_release_the_lock() {
        let store = SharedStateStore::new(Arc::new(MemoryBackend::new()), Duration::from_secs(5));
        assert!(lock_and_load(&store, "gone", policy()).await.unwrap().is_none());
        assert!(store.acquire_session_lock("gone").await.unwrap().is_some());
    }
}
