use std::{collections::HashSet, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::AppConfig,
    dao::{keys, shared_store::SharedStateStore, storage::StoreResult},
    services::collaborators::IdentityClient,
};

/// Rate-window and blacklist bookkeeping key used for a capture client.
pub fn capture_identity_id(connect_code: &str) -> String {
    format!("capture:{connect_code}")
}

/// Primary and secondary identities plus their rate and blacklist state.
///
/// Rate counters live in the shared store so every process sees the same
/// windows; the local blacklist only saves a store round-trip.
pub struct IdentityPool {
    primary: Option<Arc<dyn IdentityClient>>,
    secondaries: Vec<Arc<dyn IdentityClient>>,
    store: SharedStateStore,
    blacklisted_until: DashMap<String, Instant>,
    rate_window: Duration,
    rate_threshold: u64,
    cooldown: Duration,
}

impl IdentityPool {
    pub fn new(
        store: SharedStateStore,
        config: &AppConfig,
        primary: Option<Arc<dyn IdentityClient>>,
        secondaries: Vec<Arc<dyn IdentityClient>>,
    ) -> Self {
        Self {
            primary,
            secondaries,
            store,
            blacklisted_until: DashMap::new(),
            rate_window: config.rate_window,
            rate_threshold: config.rate_threshold,
            cooldown: config.blacklist_cooldown,
        }
    }

    pub fn primary(&self) -> Option<&Arc<dyn IdentityClient>> {
        self.primary.as_ref()
    }

    pub fn secondaries(&self) -> &[Arc<dyn IdentityClient>] {
        &self.secondaries
    }

    /// Secondary identities worth trying for one change of a batch.
    ///
    /// Once `used` holds `budget` identities only those may be reused; before
    /// that, unused identities come first.
    pub fn candidates(
        &self,
        used: &HashSet<String>,
        budget: usize,
    ) -> Vec<Arc<dyn IdentityClient>> {
        if budget == 0 {
            return Vec::new();
        }
        let (mut reused, fresh): (Vec<_>, Vec<_>) = self
            .secondaries
            .iter()
            .cloned()
            .partition(|identity| used.contains(identity.id()));
        if used.len() >= budget {
            return reused;
        }
        let mut ordered = fresh;
        ordered.append(&mut reused);
        ordered
    }

    /// Count one use of `identity_id` in `guild_id`; `false` means skip it.
    pub async fn try_reserve(&self, guild_id: &str, identity_id: &str) -> StoreResult<bool> {
        let key = keys::rate(guild_id, identity_id);
        if self.is_blacklisted_locally(&key) {
            debug!(guild_id, identity_id, "identity blacklisted locally");
            return Ok(false);
        }
        self.store
            .increment_and_test_rate_window(&key, self.rate_window, self.rate_threshold)
            .await
    }

    /// Disable `identity_id` in `guild_id` for the cool-down period.
    pub async fn blacklist(&self, guild_id: &str, identity_id: &str) {
        let key = keys::rate(guild_id, identity_id);
        self.blacklisted_until
            .insert(key.clone(), Instant::now() + self.cooldown);
        warn!(
            guild_id,
            identity_id,
            cooldown_secs = self.cooldown.as_secs(),
            "identity blacklisted"
        );
        if let Err(err) = self
            .store
            .blacklist(&key, self.cooldown, self.rate_threshold)
            .await
        {
            warn!(error = %err, %key, "failed to persist identity blacklist");
        }
    }

    fn is_blacklisted_locally(&self, key: &str) -> bool {
        let now = Instant::now();
        let until = self.blacklisted_until.get(key).map(|until| *until);
        match until {
            Some(until) if until > now => true,
            Some(_) => {
                self.blacklisted_until
                    .remove_if(key, |_, until| *until <= now);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{FutureExt, future::BoxFuture};

    use super::*;
    use crate::{
        dao::shared_store::MemoryBackend,
        services::collaborators::ApiError,
    };

    struct Named(&'static str);

    impl IdentityClient for Named {
        fn id(&self) -> &str {
            self.0
        }

        fn set_voice_state(
            &self,
            _guild_id: &str,
            _user_id: &str,
            _mute: bool,
            _deaf: bool,
        ) -> BoxFuture<'static, Result<(), ApiError>> {
            futures::future::ready(Ok(())).boxed()
        }

        fn is_guild_member(&self, _guild_id: &str) -> BoxFuture<'static, Result<bool, ApiError>> {
            futures::future::ready(Ok(true)).boxed()
        }

        fn leave_guild(&self, _guild_id: &str) -> BoxFuture<'static, Result<(), ApiError>> {
            futures::future::ready(Ok(())).boxed()
        }
    }

    fn pool(config: &AppConfig) -> IdentityPool {
        let store = SharedStateStore::new(Arc::new(MemoryBackend::new()), Duration::from_secs(5));
        IdentityPool::new(
            store,
            config,
            Some(Arc::new(Named("primary"))),
            vec![
                Arc::new(Named("a")),
                Arc::new(Named("b")),
                Arc::new(Named("c")),
            ],
        )
    }

    fn ids(identities: &[Arc<dyn IdentityClient>]) -> Vec<&str> {
        identities.iter().map(|identity| identity.id()).collect()
    }

    #[test]
    fn candidates_respect_the_budget() {
        let pool = pool(&AppConfig::default());
        let mut used = HashSet::new();

        assert!(pool.candidates(&used, 0).is_empty());
        assert_eq!(ids(&pool.candidates(&used, 2)), ["a", "b", "c"]);

        used.insert("b".to_string());
        assert_eq!(ids(&pool.candidates(&used, 2)), ["a", "c", "b"]);

        used.insert("a".to_string());
        assert_eq!(ids(&pool.candidates(&used, 2)), ["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn blacklisted_identities_are_skipped_until_the_cooldown_ends() {
        let config = AppConfig::default();
        let pool = pool(&config);

        assert!(pool.try_reserve("g", "a").await.unwrap());
        pool.blacklist("g", "a").await;
        assert!(!pool.try_reserve("g", "a").await.unwrap());
        assert!(pool.try_reserve("other", "a").await.unwrap());

        tokio::time::advance(config.blacklist_cooldown + Duration::from_secs(1)).await;
        assert!(pool.try_reserve("g", "a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_window_is_shared_through_the_store() {
        let mut config = AppConfig::default();
        config.rate_threshold = 3;
        let pool = pool(&config);

        assert!(pool.try_reserve("g", "a").await.unwrap());
        assert!(pool.try_reserve("g", "a").await.unwrap());
        assert!(!pool.try_reserve("g", "a").await.unwrap());
        assert!(pool.try_reserve("g", "b").await.unwrap());
    }
}
