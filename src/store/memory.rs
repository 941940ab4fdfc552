//! In-process [`Store`] for tests and local runs.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::{KeyValue, LeaseId, Result, Store, StoreError, WatchEvent, WatchStream};

/// Capacity of the change feed shared by all watchers.
const EVENT_CAPACITY: usize = 1024;

/// A key-value store with leases and prefix watches, held in memory.
///
/// Clones and reconnected handles share the same data. Leases never expire on
/// their own; use [`MemoryStore::revoke_lease`] to simulate expiry. The fault
/// hooks, compiled for tests and with the `test-util` feature, reproduce lost
/// leases, lost connections and failed writes.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    keep_alive_faults: Mutex<VecDeque<StoreError>>,
    failing_prefixes: Mutex<HashSet<String>>,
    leases_granted: AtomicU64,
    keep_alives: AtomicU64,
    connections: AtomicU64,
}

#[derive(Default)]
struct State {
    next_lease: LeaseId,
    leases: HashSet<LeaseId>,
    data: BTreeMap<String, (String, LeaseId)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.keys())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    next_lease: 1,
                    ..State::default()
                }),
                events,
                keep_alive_faults: Mutex::new(VecDeque::new()),
                failing_prefixes: Mutex::new(HashSet::new()),
                leases_granted: AtomicU64::new(0),
                keep_alives: AtomicU64::new(0),
                connections: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .data
            .get(key)
            .map(|(value, _)| value.clone())
    }

    /// Returns the lease `key` is attached to.
    #[must_use]
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.inner.state.lock().data.get(key).map(|(_, lease)| *lease)
    }

    /// Returns all stored keys in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().data.keys().cloned().collect()
    }

    /// Returns `true` if the lease is alive.
    #[must_use]
    pub fn lease_alive(&self, lease: LeaseId) -> bool {
        self.inner.state.lock().leases.contains(&lease)
    }

    /// Number of leases granted so far.
    #[must_use]
    pub fn leases_granted(&self) -> u64 {
        self.inner.leases_granted.load(Ordering::SeqCst)
    }

    /// Number of successful keep-alives so far.
    #[must_use]
    pub fn keep_alives(&self) -> u64 {
        self.inner.keep_alives.load(Ordering::SeqCst)
    }

    /// Number of connections opened so far, including the first.
    #[must_use]
    pub fn connections(&self) -> u64 {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Revokes a lease and deletes every key attached to it, as expiry would.
    pub fn revoke_lease(&self, lease: LeaseId) {
        let removed: Vec<String> = {
            let mut state = self.inner.state.lock();
            state.leases.remove(&lease);

            let keys: Vec<String> = state
                .data
                .iter()
                .filter(|(_, (_, owner))| *owner == lease)
                .map(|(key, _)| key.clone())
                .collect();

            for key in &keys {
                state.data.remove(key);
            }

            keys
        };

        for key in removed {
            self.publish(WatchEvent::Delete(key));
        }
    }

    /// Deletes a key out-of-band, as an administrator would.
    pub fn remove_key(&self, key: &str) {
        if self.inner.state.lock().data.remove(key).is_some() {
            self.publish(WatchEvent::Delete(key.to_string()));
        }
    }

    /// Writes a key out-of-band, attached to a fresh lease.
    pub fn insert(&self, key: &str, value: &str) -> LeaseId {
        let lease = self.grant_lease();
        self.inner
            .state
            .lock()
            .data
            .insert(key.to_string(), (value.to_string(), lease));
        self.publish(WatchEvent::Put(KeyValue::new(key, value)));
        lease
    }

    /// Makes the next keep-alive fail with `error`.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_next_keep_alive(&self, error: StoreError) {
        self.inner.keep_alive_faults.lock().push_back(error);
    }

    /// Makes every write and delete under `prefix` fail until cleared.
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_writes_under(&self, prefix: &str) {
        self.inner.failing_prefixes.lock().insert(prefix.to_string());
    }

    /// Clears all write failures.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_write_failures(&self) {
        self.inner.failing_prefixes.lock().clear();
    }

    fn grant_lease(&self) -> LeaseId {
        let mut state = self.inner.state.lock();
        let lease = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(lease);
        self.inner.leases_granted.fetch_add(1, Ordering::SeqCst);
        lease
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        let failing = self.inner.failing_prefixes.lock();

        match failing.iter().find(|prefix| key.starts_with(prefix.as_str())) {
            Some(prefix) => Err(StoreError::Other(format!("writes under {prefix} are failing"))),
            None => Ok(()),
        }
    }

    fn publish(&self, event: WatchEvent) {
        // No receivers just means nobody is watching.
        let _ = self.inner.events.send(event);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn grant(&self, _ttl: i64) -> Result<LeaseId> {
        Ok(self.grant_lease())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<()> {
        if let Some(fault) = self.inner.keep_alive_faults.lock().pop_front() {
            return Err(fault);
        }

        if !self.lease_alive(lease) {
            return Err(StoreError::LeaseNotFound);
        }

        self.inner.keep_alives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        self.check_writable(key)?;

        {
            let mut state = self.inner.state.lock();

            if !state.leases.contains(&lease) {
                return Err(StoreError::LeaseNotFound);
            }

            state
                .data
                .insert(key.to_string(), (value.to_string(), lease));
        }

        self.publish(WatchEvent::Put(KeyValue::new(key, value)));
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.inner.state.lock();

        Ok(state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, (value, _))| KeyValue::new(key.clone(), value.clone()))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable(key)?;
        self.remove_key(key);
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let receiver = self.inner.events.subscribe();
        let prefix = prefix.to_string();

        let stream = stream::unfold(receiver, move |mut receiver| {
            let prefix = prefix.clone();

            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if event.key().starts_with(&prefix) => {
                            return Some((Ok(vec![event]), receiver));
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(missed)) => {
                            let error = StoreError::Other(format!("watch lagged by {missed} events"));
                            return Some((Err(error), receiver));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn reconnect(&self) -> Result<Self> {
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_requires_live_lease() {
        let store = MemoryStore::new();

        let result = store.put("k", "v", 42).await;
        assert!(matches!(result, Err(StoreError::LeaseNotFound)));

        let lease = store.grant(10).await.unwrap();
        store.put("k", "v", lease).await.unwrap();
        assert_eq!(store.get("k").as_deref(), Some("v"));
        assert_eq!(store.lease_of("k"), Some(lease));
    }

    #[tokio::test]
    async fn get_prefix_returns_only_matching_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(10).await.unwrap();

        store.put("a-services:x:1", "1", lease).await.unwrap();
        store.put("a-services:y:1", "2", lease).await.unwrap();
        store.put("b-services:x:1", "3", lease).await.unwrap();

        let entries = store.get_prefix("a-services:").await.unwrap();
        assert_eq!(
            entries,
            vec![
                KeyValue::new("a-services:x:1", "1"),
                KeyValue::new("a-services:y:1", "2"),
            ]
        );
    }

    #[tokio::test]
    async fn revoke_lease_deletes_attached_keys() {
        let store = MemoryStore::new();
        let first = store.grant(10).await.unwrap();
        let second = store.grant(10).await.unwrap();

        store.put("k1", "1", first).await.unwrap();
        store.put("k2", "2", second).await.unwrap();
        store.revoke_lease(first);

        assert_eq!(store.keys(), vec!["k2".to_string()]);
        assert!(!store.lease_alive(first));

        let renewed = store.keep_alive_once(first).await;
        assert!(matches!(renewed, Err(StoreError::LeaseNotFound)));
    }

    #[tokio::test]
    async fn keep_alive_faults_are_consumed_in_order() {
        let store = MemoryStore::new();
        let lease = store.grant(10).await.unwrap();

        store.fail_next_keep_alive(StoreError::ConnectionLost("reset".to_string()));

        assert!(matches!(
            store.keep_alive_once(lease).await,
            Err(StoreError::ConnectionLost(_))
        ));
        assert!(store.keep_alive_once(lease).await.is_ok());
        assert_eq!(store.keep_alives(), 1);
    }

    #[tokio::test]
    async fn failing_prefix_rejects_writes() {
        let store = MemoryStore::new();
        let lease = store.grant(10).await.unwrap();

        store.fail_writes_under("bad-");
        assert!(store.put("bad-services:x", "1", lease).await.is_err());
        assert!(store.put("good-services:x", "1", lease).await.is_ok());

        store.clear_write_failures();
        assert!(store.put("bad-services:x", "1", lease).await.is_ok());
    }

    #[tokio::test]
    async fn watch_prefix_filters_events() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("a-").await.unwrap();
        let lease = store.grant(10).await.unwrap();

        store.put("b-key", "1", lease).await.unwrap();
        store.put("a-key", "2", lease).await.unwrap();
        store.remove_key("a-key");

        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first, vec![WatchEvent::Put(KeyValue::new("a-key", "2"))]);

        let second = watch.next().await.unwrap().unwrap();
        assert_eq!(second, vec![WatchEvent::Delete("a-key".to_string())]);
    }

    #[tokio::test]
    async fn reconnect_shares_data() {
        let store = MemoryStore::new();
        let fresh = store.reconnect().await.unwrap();
        let lease = fresh.grant(10).await.unwrap();

        fresh.put("k", "v", lease).await.unwrap();

        assert_eq!(store.get("k").as_deref(), Some("v"));
        assert_eq!(store.connections(), 2);
    }
}
