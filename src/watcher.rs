//! Incremental cache updates from prefix watches.
//!
//! One watcher runs per read prefix. PUT events upsert the instance into the
//! cache and DELETE events remove it. A deletion seen under the environment
//! prefix that matches one of this process's own registrations triggers a
//! re-registration; the other prefixes carry the same deletion and are ignored
//! for that purpose so it only happens once.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cache::ServiceCache;
use crate::namespace::{self, Namespace};
use crate::registrar::Registrar;
use crate::store::{Store, WatchEvent, WatchStream};

/// What every watcher of one registry shares.
pub(crate) struct WatchContext<S> {
    pub(crate) store: Arc<S>,
    pub(crate) namespace: Namespace,
    pub(crate) cache: Arc<ServiceCache>,
    pub(crate) registrar: Arc<Registrar<S>>,
    pub(crate) retry_interval: Duration,
    pub(crate) cancel: CancellationToken,
}

impl<S> Clone for WatchContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            namespace: self.namespace.clone(),
            cache: self.cache.clone(),
            registrar: self.registrar.clone(),
            retry_interval: self.retry_interval,
            cancel: self.cancel.clone(),
        }
    }
}

pub(crate) struct Watcher<S> {
    context: WatchContext<S>,
    prefix: String,
    pending: Mutex<Option<WatchStream>>,
}

impl<S: Store> Watcher<S> {
    /// Creates a watcher for `prefix`, starting from `stream` if one is already open.
    pub(crate) fn new(context: WatchContext<S>, prefix: &str, stream: Option<WatchStream>) -> Self {
        Self {
            context,
            prefix: prefix.to_string(),
            pending: Mutex::new(stream),
        }
    }

    /// Applies watch events until cancelled, re-opening the watch whenever it fails.
    pub(crate) async fn run(self: Arc<Self>) {
        let scope = namespace::scope(&self.prefix, "");

        loop {
            let pending = self.pending.lock().take();

            let stream = match pending {
                Some(stream) => Some(stream),
                None => match self.context.store.watch_prefix(&scope).await {
                    Ok(stream) => {
                        tracing::debug!("watching {scope}");
                        Some(stream)
                    }
                    Err(e) => {
                        tracing::warn!("failed to watch {scope}: {e}");
                        None
                    }
                },
            };

            if let Some(mut stream) = stream {
                loop {
                    tokio::select! {
                        () = self.context.cancel.cancelled() => return,

                        batch = stream.next() => match batch {
                            Some(Ok(events)) => {
                                for event in events {
                                    self.apply(event).await;
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!("watch on {scope} failed: {e}");
                                break;
                            }
                            None => {
                                tracing::warn!("watch on {scope} ended");
                                break;
                            }
                        },
                    }
                }
            }

            tokio::select! {
                () = self.context.cancel.cancelled() => return,
                () = tokio::time::sleep(self.context.retry_interval) => {}
            }
        }
    }

    /// Applies one event to the cache.
    pub(crate) async fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Put(kv) => {
                let Some((_, record)) = namespace::parse_entry(&kv.key, &kv.value) else {
                    tracing::warn!("ignoring invalid key {}", kv.key);
                    return;
                };

                tracing::debug!("instance up: {record} weight {}", record.weight);
                self.context.cache.upsert(record);
            }

            WatchEvent::Delete(key) => {
                let Some((prefix, record)) = namespace::parse_entry(&key, "0") else {
                    tracing::warn!("ignoring invalid key {key}");
                    return;
                };

                tracing::debug!("instance down: {record}");
                self.context.cache.remove(&record.service_name, &record.ip, record.port);

                if prefix == self.context.namespace.env_prefix() {
                    self.context.registrar.reregister(&record).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::RegistryConfig;
    use crate::record::ServiceRecord;
    use crate::store::{KeyValue, MemoryStore};

    use super::*;

    fn watcher(store: &MemoryStore, prefix: &str) -> (Watcher<MemoryStore>, Arc<ServiceCache>) {
        let config = RegistryConfig::new(Vec::<String>::new(), "test")
            .region("th")
            .advertise_ip("10.0.0.7".parse().unwrap());
        let store = Arc::new(store.clone());
        let cache = Arc::new(ServiceCache::new());
        let cancel = CancellationToken::new();
        let registrar = Arc::new(Registrar::new(store.clone(), &config, cancel.clone()));

        let context = WatchContext {
            store,
            namespace: config.namespace(),
            cache: cache.clone(),
            registrar,
            retry_interval: Duration::from_secs(1),
            cancel,
        };
        let watcher = Watcher::new(context, prefix, None);

        (watcher, cache)
    }

    fn put(key: &str, value: &str) -> WatchEvent {
        WatchEvent::Put(KeyValue::new(key, value))
    }

    #[tokio::test]
    async fn apply_put_upserts_record() {
        let (watcher, cache) = watcher(&MemoryStore::new(), "test-services");

        watcher.apply(put("test-services:svc:10.0.0.1:80", "4")).await;
        watcher.apply(put("test-services:svc:10.0.0.1:80", "4")).await;

        assert_eq!(
            cache.records("svc"),
            vec![ServiceRecord::new("svc", "10.0.0.1", 80, 4)]
        );
    }

    #[tokio::test]
    async fn apply_delete_removes_record() {
        let (watcher, cache) = watcher(&MemoryStore::new(), "test-services");

        watcher.apply(put("test-services:svc:10.0.0.1:80", "4")).await;
        watcher.apply(put("test-services:svc:10.0.0.2:80", "4")).await;
        watcher
            .apply(WatchEvent::Delete("test-services:svc:10.0.0.1:80".to_string()))
            .await;

        assert_eq!(
            cache.records("svc"),
            vec![ServiceRecord::new("svc", "10.0.0.2", 80, 4)]
        );
    }

    #[tokio::test]
    async fn watchers_from_one_context_share_cache() {
        let (first, cache) = watcher(&MemoryStore::new(), "test-services");
        let second = Watcher::new(first.context.clone(), "th-test-services", None);

        first.apply(put("test-services:svc:10.0.0.1:80", "1")).await;
        second.apply(put("th-test-services:svc:10.0.0.2:80", "1")).await;

        assert_eq!(cache.records("svc").len(), 2);
    }

    #[tokio::test]
    async fn apply_ignores_invalid_keys() {
        let (watcher, cache) = watcher(&MemoryStore::new(), "test-services");

        watcher.apply(put("test-services:svc:10.0.0.1", "4")).await;
        watcher
            .apply(WatchEvent::Delete("garbage".to_string()))
            .await;

        assert!(cache.records("svc").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn run_applies_store_changes() {
        let store = MemoryStore::new();
        let (watcher, cache) = watcher(&store, "th-test-services");
        let watcher = Arc::new(watcher);
        let handle = tokio::spawn(watcher.clone().run());

        // Let the watcher subscribe before writing.
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.insert("th-test-services:svc:10.0.0.1:80", "2");
        store.insert("test-services:svc:10.0.0.2:80", "2");
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            cache.records("svc"),
            vec![ServiceRecord::new("svc", "10.0.0.1", 80, 2)]
        );

        watcher.context.cancel.cancel();
        handle.await.unwrap();
    }
}
