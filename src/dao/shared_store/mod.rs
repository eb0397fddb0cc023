pub mod memory;

use std::{sync::Arc, time::Duration};

use futures::{future::BoxFuture, stream::BoxStream};
use tracing::{debug, warn};
use uuid::Uuid;

pub use self::memory::MemoryBackend;
use crate::{
    dao::{
        keys,
        storage::{StoreError, StoreResult},
    },
    state::{player::normalize_name, session::SessionRecord},
};

/// Primitive operations every shared store backend provides.
///
/// The shape follows a networked key/value server: string keys with optional
/// TTL, atomic set-if-absent and counters, FIFO lists, sets and fire-and-forget
/// pub/sub channels. Higher level session semantics live in [`SharedStateStore`].
pub trait StoreBackend: Send + Sync {
    fn get(&self, key: String) -> BoxFuture<'static, StoreResult<Option<String>>>;
    fn set(
        &self,
        key: String,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StoreResult<()>>;
    /// Atomically store `value` only when `key` is absent.
    fn set_if_absent(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StoreResult<bool>>;
    fn delete(&self, key: String) -> BoxFuture<'static, StoreResult<bool>>;
    /// Atomically delete `key` only when it still holds `expected`.
    fn delete_if_equals(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, StoreResult<bool>>;
    /// Increment a counter, applying `ttl` only when the counter is created.
    fn increment(&self, key: String, ttl: Duration) -> BoxFuture<'static, StoreResult<u64>>;
    fn push_back(&self, key: String, value: String) -> BoxFuture<'static, StoreResult<usize>>;
    fn pop_front(&self, key: String) -> BoxFuture<'static, StoreResult<Option<String>>>;
    fn expire(&self, key: String, ttl: Duration) -> BoxFuture<'static, StoreResult<bool>>;
    fn set_add(&self, key: String, member: String) -> BoxFuture<'static, StoreResult<bool>>;
    fn set_members(&self, key: String) -> BoxFuture<'static, StoreResult<Vec<String>>>;
    /// Publish on a channel, returning how many subscribers received it.
    fn publish(&self, channel: String, message: String) -> BoxFuture<'static, StoreResult<usize>>;
    /// Subscribe to a channel; messages published after this resolves are delivered.
    fn subscribe(
        &self,
        channel: String,
    ) -> BoxFuture<'static, StoreResult<BoxStream<'static, String>>>;
    fn health_check(&self) -> BoxFuture<'static, StoreResult<()>>;
}

/// Proof of exclusive write access to one session record.
///
/// Released by [`SharedStateStore::put_session`] or
/// [`SharedStateStore::release_session_lock`]; otherwise it lapses when its lease expires.
#[derive(Debug)]
#[must_use = "session locks must be released through put_session or release_session_lock"]
pub struct SessionLock {
    session_id: String,
    key: String,
    token: String,
}

impl SessionLock {
    /// Session guarded by this lock.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Short-lived marker that a voice batch is in flight for a session.
///
/// Expires on its own unless released earlier.
#[derive(Debug)]
pub struct VoiceChangeLock {
    key: String,
    token: String,
    ttl: Duration,
}

impl VoiceChangeLock {
    /// How long the marker stays in place.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store key of the marker.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Secondary handles a session can be found by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPointer<'a> {
    ConnectCode(&'a str),
    VoiceChannel(&'a str),
    TextChannel(&'a str),
}

impl SessionPointer<'_> {
    fn key(&self) -> String {
        match self {
            SessionPointer::ConnectCode(code) => keys::code_pointer(code),
            SessionPointer::VoiceChannel(id) => keys::voice_pointer(id),
            SessionPointer::TextChannel(id) => keys::text_pointer(id),
        }
    }
}

/// Session-level view over a [`StoreBackend`]: locking, records, pointers and rate windows.
#[derive(Clone)]
pub struct SharedStateStore {
    backend: Arc<dyn StoreBackend>,
    lock_lease: Duration,
}

impl SharedStateStore {
    /// Wrap a backend; `lock_lease` bounds how long a crashed holder can block a session.
    pub fn new(backend: Arc<dyn StoreBackend>, lock_lease: Duration) -> Self {
        Self {
            backend,
            lock_lease,
        }
    }

    /// Raw backend, for queue and channel primitives.
    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    /// Try once to take the session lock. Returns `None` when someone else holds it.
    pub async fn acquire_session_lock(&self, session_id: &str) -> StoreResult<Option<SessionLock>> {
        let key = keys::session_lock(session_id);
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .backend
            .set_if_absent(key.clone(), token.clone(), self.lock_lease)
            .await?;
        Ok(acquired.then(|| SessionLock {
            session_id: session_id.to_string(),
            key,
            token,
        }))
    }

    /// Give the lock back without writing.
    pub async fn release_session_lock(&self, lock: SessionLock) -> StoreResult<()> {
        let released = self
            .backend
            .delete_if_equals(lock.key.clone(), lock.token)
            .await?;
        if !released {
            warn!(key = %lock.key, "session lock lease expired before release");
        }
        Ok(())
    }

    /// Load the record of a session, if it exists.
    pub async fn get_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let key = keys::session(session_id);
        let Some(raw) = self.backend.get(key.clone()).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Serialization { key, source })
    }

    /// Write a record and its pointers, then release `lock` as the final step.
    ///
    /// Without a lock the write is an unconditional overwrite, reserved for
    /// administrative paths. With a lock whose lease was taken over by another
    /// holder nothing is written and [`StoreError::LockLost`] is returned.
    pub async fn put_session(
        &self,
        record: &SessionRecord,
        lock: Option<SessionLock>,
    ) -> StoreResult<()> {
        let result = self.write_session(record, lock.as_ref()).await;
        if let Some(lock) = lock {
            self.release_session_lock(lock).await?;
        }
        result
    }

    async fn write_session(
        &self,
        record: &SessionRecord,
        lock: Option<&SessionLock>,
    ) -> StoreResult<()> {
        if let Some(lock) = lock {
            let holder = self.backend.get(lock.key.clone()).await?;
            if holder.as_deref() != Some(lock.token.as_str()) {
                return Err(StoreError::LockLost {
                    key: lock.key.clone(),
                });
            }
        }

        let key = keys::session(&record.session_id);
        let encoded = serde_json::to_string(record).map_err(|source| {
            StoreError::Serialization {
                key: key.clone(),
                source,
            }
        })?;
        self.backend.set(key, encoded, None).await?;

        for pointer in pointers_of(record) {
            self.backend
                .set(pointer.key(), record.session_id.clone(), None)
                .await?;
        }
        Ok(())
    }

    /// Remove a record and whichever pointers still reference it.
    pub async fn delete_session(&self, session_id: &str) -> StoreResult<Option<SessionRecord>> {
        let record = self.get_session(session_id).await?;
        self.backend.delete(keys::session(session_id)).await?;
        if let Some(record) = record.as_ref() {
            for pointer in pointers_of(record) {
                self.backend
                    .delete_if_equals(pointer.key(), session_id.to_string())
                    .await?;
            }
        }
        debug!(session_id, "session record deleted");
        Ok(record)
    }

    /// Resolve a connect code or channel id to the canonical session id.
    pub async fn resolve(&self, pointer: SessionPointer<'_>) -> StoreResult<Option<String>> {
        self.backend.get(pointer.key()).await
    }

    /// Try once to mark a voice batch as in flight for `ttl`.
    pub async fn acquire_voice_change_lock(
        &self,
        session_id: &str,
        ttl: Duration,
    ) -> StoreResult<Option<VoiceChangeLock>> {
        let key = keys::voice_lock(session_id);
        let token = Uuid::new_v4().to_string();
        let acquired = self
            .backend
            .set_if_absent(key.clone(), token.clone(), ttl)
            .await?;
        Ok(acquired.then_some(VoiceChangeLock { key, token, ttl }))
    }

    /// Drop a voice-change marker before its TTL runs out.
    ///
    /// Returns `false` when the marker already expired; a marker taken over by
    /// another batch is left in place.
    pub async fn release_voice_change_lock(&self, lock: VoiceChangeLock) -> StoreResult<bool> {
        let released = self
            .backend
            .delete_if_equals(lock.key.clone(), lock.token)
            .await?;
        if !released {
            debug!(key = %lock.key, "voice-change lock expired before release");
        }
        Ok(released)
    }

    /// Count one use of an identity and report whether it is still usable in this window.
    pub async fn increment_and_test_rate_window(
        &self,
        identity_key: &str,
        window: Duration,
        threshold: u64,
    ) -> StoreResult<bool> {
        let count = self
            .backend
            .increment(identity_key.to_string(), window)
            .await?;
        Ok(count < threshold)
    }

    /// Pin an identity's counter at `threshold` for `duration`, disabling it regardless of use.
    pub async fn blacklist(
        &self,
        identity_key: &str,
        duration: Duration,
        threshold: u64,
    ) -> StoreResult<()> {
        self.backend
            .set(
                identity_key.to_string(),
                threshold.to_string(),
                Some(duration),
            )
            .await
    }

    /// Remember that `user_id` played as `ingame_name` in this guild.
    pub async fn remember_name(
        &self,
        guild_id: &str,
        ingame_name: &str,
        user_id: &str,
    ) -> StoreResult<()> {
        let key = keys::names(guild_id, &normalize_name(ingame_name));
        self.backend.set_add(key, user_id.to_string()).await?;
        Ok(())
    }

    /// Users previously linked to `ingame_name` in this guild.
    pub async fn name_candidates(
        &self,
        guild_id: &str,
        ingame_name: &str,
    ) -> StoreResult<Vec<String>> {
        let key = keys::names(guild_id, &normalize_name(ingame_name));
        self.backend.set_members(key).await
    }

    pub async fn publish(&self, channel: String, message: String) -> StoreResult<usize> {
        self.backend.publish(channel, message).await
    }

    pub async fn subscribe(&self, channel: String) -> StoreResult<BoxStream<'static, String>> {
        self.backend.subscribe(channel).await
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        self.backend.health_check().await
    }
}

fn pointers_of(record: &SessionRecord) -> Vec<SessionPointer<'_>> {
    let mut pointers = vec![SessionPointer::ConnectCode(&record.connect_code)];
    if !record.voice_channel_id.is_empty() {
        pointers.push(SessionPointer::VoiceChannel(&record.voice_channel_id));
    }
    if !record.text_channel_id().is_empty() {
        pointers.push(SessionPointer::TextChannel(record.text_channel_id()));
    }
    pointers
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state::game::Phase;

    const LEASE: Duration = Duration::from_secs(5);

    fn store() -> SharedStateStore {
        SharedStateStore::new(Arc::new(MemoryBackend::new()), LEASE)
    }

    #[tokio::test]
    async fn session_lock_is_exclusive_until_put() {
        let store = store();
        let record = SessionRecord::new("guild", "CODE", "text", "voice");

        let lock = store
            .acquire_session_lock(&record.session_id)
            .await
            .unwrap()
            .expect("first acquire succeeds");
        assert!(
            store
                .acquire_session_lock(&record.session_id)
                .await
                .unwrap()
                .is_none()
        );

        store.put_session(&record, Some(lock)).await.unwrap();
        let again = store.acquire_session_lock(&record.session_id).await.unwrap();
        assert!(again.is_some());
        store.release_session_lock(again.unwrap()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_rejects_the_stale_writer() {
        let store = store();
        let mut record = SessionRecord::new("guild", "CODE", "text", "voice");
        store.put_session(&record, None).await.unwrap();

        let stale = store
            .acquire_session_lock(&record.session_id)
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(LEASE + Duration::from_millis(1)).await;
        let fresh = store
            .acquire_session_lock(&record.session_id)
            .await
            .unwrap()
            .unwrap();

        record.game.phase = Phase::Tasks;
        let err = store.put_session(&record, Some(stale)).await.unwrap_err();
        assert!(matches!(err, StoreError::LockLost { .. }));
        let stored = store.get_session(&record.session_id).await.unwrap().unwrap();
        assert_eq!(stored.game.phase, Phase::Uninitialized);

        store.put_session(&record, Some(fresh)).await.unwrap();
        let stored = store.get_session(&record.session_id).await.unwrap().unwrap();
        assert_eq!(stored.game.phase, Phase::Tasks);
    }

    #[tokio::test]
    async fn record_round_trips_through_the_store() {
        let store = store();
        let mut record = SessionRecord::new("guild", "CODE", "text", "voice");
        record.link("u1", "Red");
        record.linkage["u1"].desired_deaf = true;
        record.start_match(7, 1_700_000_000);
        store.put_session(&record, None).await.unwrap();

        let loaded = store.get_session(&record.session_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn pointers_follow_the_record() {
        let store = store();
        let record = SessionRecord::new("guild", "CODE", "text-1", "voice-1");
        store.put_session(&record, None).await.unwrap();

        for pointer in [
            SessionPointer::ConnectCode("CODE"),
            SessionPointer::VoiceChannel("voice-1"),
            SessionPointer::TextChannel("text-1"),
        ] {
            assert_eq!(
                store.resolve(pointer).await.unwrap().as_deref(),
                Some(record.session_id.as_str())
            );
        }

        let deleted = store.delete_session(&record.session_id).await.unwrap();
        assert_eq!(deleted, Some(record));
        assert!(
            store
                .resolve(SessionPointer::VoiceChannel("voice-1"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn deleting_a_replaced_session_keeps_the_new_pointers() {
        let store = store();
        let old = SessionRecord::new("guild", "OLD", "text", "voice");
        let new = SessionRecord::new("guild", "NEW", "text", "voice");
        store.put_session(&old, None).await.unwrap();
        store.put_session(&new, None).await.unwrap();

        store.delete_session(&old.session_id).await.unwrap();
        assert_eq!(
            store
                .resolve(SessionPointer::TextChannel("text"))
                .await
                .unwrap()
                .as_deref(),
            Some(new.session_id.as_str())
        );
        assert!(
            store
                .resolve(SessionPointer::ConnectCode("OLD"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rate_window_allows_threshold_minus_one_calls() {
        let store = store();
        let window = Duration::from_secs(5);
        let threshold = 4;

        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(
                store
                    .increment_and_test_rate_window("rate:g:id", window, threshold)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(results, [true, true, true, false, false, false]);

        tokio::time::advance(window + Duration::from_millis(1)).await;
        assert!(
            store
                .increment_and_test_rate_window("rate:g:id", window, threshold)
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blacklist_disables_an_identity_for_its_duration() {
        let store = store();
        let window = Duration::from_secs(5);
        let cooldown = Duration::from_secs(300);
        store.blacklist("rate:g:id", cooldown, 7).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(
            !store
                .increment_and_test_rate_window("rate:g:id", window, 7)
                .await
                .unwrap()
        );

        tokio::time::advance(cooldown).await;
        assert!(
            store
                .increment_and_test_rate_window("rate:g:id", window, 7)
                .await
                .unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn voice_change_lock_expires_on_its_own() {
        let store = store();
        let ttl = Duration::from_secs(8);
        let lock = store.acquire_voice_change_lock("s", ttl).await.unwrap();
        assert!(lock.is_some());
        assert!(store.acquire_voice_change_lock("s", ttl).await.unwrap().is_none());

        tokio::time::advance(ttl).await;
        let relocked = store.acquire_voice_change_lock("s", ttl).await.unwrap();
        store
            .release_voice_change_lock(relocked.unwrap())
            .await
            .unwrap();
        assert!(store.acquire_voice_change_lock("s", ttl).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_voice_lock_release_keeps_the_new_holder() {
        let store = store();
        let ttl = Duration::from_secs(2);
        let first = store
            .acquire_voice_change_lock("s", ttl)
            .await
            .unwrap()
            .unwrap();
        tokio::time::advance(ttl + Duration::from_millis(1)).await;
        let second = store
            .acquire_voice_change_lock("s", ttl)
            .await
            .unwrap()
            .unwrap();

        assert!(!store.release_voice_change_lock(first).await.unwrap());
        assert!(store.acquire_voice_change_lock("s", ttl).await.unwrap().is_none());

        assert!(store.release_voice_change_lock(second).await.unwrap());
        assert!(store.acquire_voice_change_lock("s", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn name_candidates_are_normalized() {
        let store = store();
        store.remember_name("g", "Sus Boi", "u1").await.unwrap();
        store.remember_name("g", "susboi", "u2").await.unwrap();
        assert_eq!(
            store.name_candidates("g", "SUSBOI").await.unwrap(),
            vec!["u1".to_string(), "u2".to_string()]
        );
        assert!(store.name_candidates("other", "susboi").await.unwrap().is_empty());
    }
}
