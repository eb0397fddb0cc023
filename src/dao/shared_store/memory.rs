//! In-process store backend used by single-node deployments and tests.

use std::{
    collections::{BTreeSet, VecDeque},
    io,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::{
    FutureExt, StreamExt,
    future::{self, BoxFuture},
    stream::BoxStream,
};
use tokio::{sync::broadcast, time::Instant};
use tokio_stream::wrappers::BroadcastStream;

use super::StoreBackend;
use crate::dao::storage::{StoreError, StoreResult};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn text(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Text(value),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// [`StoreBackend`] keeping every key, list and channel in process memory.
///
/// Expiry is evaluated lazily against the Tokio clock, so paused-time tests
/// can step over TTLs.
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Slot>,
    channels: DashMap<String, broadcast::Sender<String>>,
    offline: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails until switched back on.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(
                "memory backend is offline".into(),
                io::Error::new(io::ErrorKind::NotConnected, "offline"),
            ));
        }
        Ok(())
    }

    fn purge_expired(&self, key: &str) {
        let now = Instant::now();
        self.entries.remove_if(key, |_, slot| slot.is_expired(now));
    }

    fn get_sync(&self, key: String) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        self.purge_expired(&key);
        match self.entries.get(&key) {
            Some(slot) => match &slot.value {
                Value::Text(text) => Ok(Some(text.clone())),
                _ => Err(StoreError::WrongType { key }),
            },
            None => Ok(None),
        }
    }

    fn set_if_absent_sync(&self, key: String, value: String, ttl: Duration) -> StoreResult<bool> {
        self.ensure_online()?;
        self.purge_expired(&key);
        match self.entries.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::text(value, Some(ttl)));
                Ok(true)
            }
        }
    }

    fn delete_if_equals_sync(&self, key: String, expected: String) -> StoreResult<bool> {
        self.ensure_online()?;
        self.purge_expired(&key);
        let removed = self.entries.remove_if(&key, |_, slot| {
            matches!(&slot.value, Value::Text(current) if *current == expected)
        });
        Ok(removed.is_some())
    }

    fn increment_sync(&self, key: String, ttl: Duration) -> StoreResult<u64> {
        self.ensure_online()?;
        self.purge_expired(&key);
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let Value::Text(text) = &mut occupied.get_mut().value else {
                    return Err(StoreError::WrongType { key });
                };
                let next = text
                    .parse::<u64>()
                    .map_err(|_| StoreError::WrongType { key })?
                    .saturating_add(1);
                *text = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::text("1".into(), Some(ttl)));
                Ok(1)
            }
        }
    }

    fn push_back_sync(&self, key: String, value: String) -> StoreResult<usize> {
        self.ensure_online()?;
        self.purge_expired(&key);
        let mut slot = self.entries.entry(key.clone()).or_insert_with(|| Slot {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::List(list) => {
                list.push_back(value);
                Ok(list.len())
            }
            _ => Err(StoreError::WrongType { key }),
        }
    }

    fn pop_front_sync(&self, key: String) -> StoreResult<Option<String>> {
        self.ensure_online()?;
        self.purge_expired(&key);
        let popped = match self.entries.get_mut(&key) {
            Some(mut slot) => match &mut slot.value {
                Value::List(list) => list.pop_front(),
                _ => return Err(StoreError::WrongType { key }),
            },
            None => None,
        };
        self.entries
            .remove_if(&key, |_, slot| matches!(&slot.value, Value::List(list) if list.is_empty()));
        Ok(popped)
    }

    fn expire_sync(&self, key: String, ttl: Duration) -> StoreResult<bool> {
        self.ensure_online()?;
        self.purge_expired(&key);
        match self.entries.get_mut(&key) {
            Some(mut slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn set_add_sync(&self, key: String, member: String) -> StoreResult<bool> {
        self.ensure_online()?;
        self.purge_expired(&key);
        let mut slot = self.entries.entry(key.clone()).or_insert_with(|| Slot {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::Set(set) => Ok(set.insert(member)),
            _ => Err(StoreError::WrongType { key }),
        }
    }

    fn set_members_sync(&self, key: String) -> StoreResult<Vec<String>> {
        self.ensure_online()?;
        self.purge_expired(&key);
        match self.entries.get(&key) {
            Some(slot) => match &slot.value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                _ => Err(StoreError::WrongType { key }),
            },
            None => Ok(Vec::new()),
        }
    }

    fn publish_sync(&self, channel: String, message: String) -> StoreResult<usize> {
        self.ensure_online()?;
        let delivered = match self.channels.get(&channel) {
            Some(sender) => sender.send(message).unwrap_or(0),
            None => return Ok(0),
        };
        if delivered == 0 {
            self.channels
                .remove_if(&channel, |_, sender| sender.receiver_count() == 0);
        }
        Ok(delivered)
    }

    fn subscribe_sync(&self, channel: String) -> StoreResult<BoxStream<'static, String>> {
        self.ensure_online()?;
        let receiver = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        // Lagged receivers skip what they missed and keep listening.
        Ok(BroadcastStream::new(receiver)
            .filter_map(|item| future::ready(item.ok()))
            .boxed())
    }
}

fn ready<T: Send + 'static>(result: StoreResult<T>) -> BoxFuture<'static, StoreResult<T>> {
    future::ready(result).boxed()
}

impl StoreBackend for MemoryBackend {
    fn get(&self, key: String) -> BoxFuture<'static, StoreResult<Option<String>>> {
        ready(self.get_sync(key))
    }

    fn set(
        &self,
        key: String,
        value: String,
        ttl: Option<Duration>,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let result = self.ensure_online().map(|()| {
            self.entries.insert(key, Slot::text(value, ttl));
        });
        ready(result)
    }

    fn set_if_absent(
        &self,
        key: String,
        value: String,
        ttl: Duration,
    ) -> BoxFuture<'static, StoreResult<bool>> {
        ready(self.set_if_absent_sync(key, value, ttl))
    }

    fn delete(&self, key: String) -> BoxFuture<'static, StoreResult<bool>> {
        let result = self.ensure_online().map(|()| {
            self.purge_expired(&key);
            self.entries.remove(&key).is_some()
        });
        ready(result)
    }

    fn delete_if_equals(
        &self,
        key: String,
        expected: String,
    ) -> BoxFuture<'static, StoreResult<bool>> {
        ready(self.delete_if_equals_sync(key, expected))
    }

    fn increment(&self, key: String, ttl: Duration) -> BoxFuture<'static, StoreResult<u64>> {
        ready(self.increment_sync(key, ttl))
    }

    fn push_back(&self, key: String, value: String) -> BoxFuture<'static, StoreResult<usize>> {
        ready(self.push_back_sync(key, value))
    }

    fn pop_front(&self, key: String) -> BoxFuture<'static, StoreResult<Option<String>>> {
        ready(self.pop_front_sync(key))
    }

    fn expire(&self, key: String, ttl: Duration) -> BoxFuture<'static, StoreResult<bool>> {
        ready(self.expire_sync(key, ttl))
    }

    fn set_add(&self, key: String, member: String) -> BoxFuture<'static, StoreResult<bool>> {
        ready(self.set_add_sync(key, member))
    }

    fn set_members(&self, key: String) -> BoxFuture<'static, StoreResult<Vec<String>>> {
        ready(self.set_members_sync(key))
    }

    fn publish(&self, channel: String, message: String) -> BoxFuture<'static, StoreResult<usize>> {
        ready(self.publish_sync(channel, message))
    }

    fn subscribe(
        &self,
        channel: String,
    ) -> BoxFuture<'static, StoreResult<BoxStream<'static, String>>> {
        ready(self.subscribe_sync(channel))
    }

    fn health_check(&self) -> BoxFuture<'static, StoreResult<()>> {
        ready(self.ensure_online())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn lists_are_fifo_and_vanish_when_drained() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.push_back("q".into(), "a".into()).await.unwrap(), 1);
        assert_eq!(backend.push_back("q".into(), "b".into()).await.unwrap(), 2);
        assert_eq!(backend.pop_front("q".into()).await.unwrap().as_deref(), Some("a"));
        assert_eq!(backend.pop_front("q".into()).await.unwrap().as_deref(), Some("b"));
        assert_eq!(backend.pop_front("q".into()).await.unwrap(), None);
        assert_eq!(backend.push_back("q".into(), "c".into()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire_against_the_tokio_clock() {
        let backend = MemoryBackend::new();
        backend
            .set("k".into(), "v".into(), Some(Duration::from_secs(2)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(backend.get("k".into()).await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.get("k".into()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn type_mismatch_is_reported() {
        let backend = MemoryBackend::new();
        backend.push_back("q".into(), "a".into()).await.unwrap();
        assert!(matches!(
            backend.get("q".into()).await,
            Err(StoreError::WrongType { .. })
        ));
        backend.set("n".into(), "text".into(), None).await.unwrap();
        assert!(matches!(
            backend.increment("n".into(), Duration::from_secs(1)).await,
            Err(StoreError::WrongType { .. })
        ));
    }

    #[tokio::test]
    async fn publish_reaches_current_subscribers_only() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.publish("c".into(), "lost".into()).await.unwrap(), 0);

        let mut stream = backend.subscribe("c".into()).await.unwrap();
        assert_eq!(backend.publish("c".into(), "hello".into()).await.unwrap(), 1);
        assert_eq!(stream.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn offline_backend_fails_every_operation() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert!(backend.health_check().await.is_err());
        assert!(backend.get("k".into()).await.is_err());
        backend.set_offline(false);
        assert!(backend.health_check().await.is_ok());
    }
}
