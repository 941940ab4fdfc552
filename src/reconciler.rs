//! Periodic full resync of the cache.
//!
//! Watch streams can drop or duplicate events. Rebuilding the cache from a full
//! read every `sync_interval` bounds how long any such drift can last.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::ServiceCache;
use crate::namespace::{self, Namespace};
use crate::record::ServiceRecord;
use crate::store::{Result, Store};

/// Reads every record of `service_name` (all services if empty) under the read policy.
pub(crate) async fn fetch<S: Store>(
    store: &S,
    namespace: &Namespace,
    service_name: &str,
) -> Result<Vec<ServiceRecord>> {
    let env_records = read_prefix(store, namespace.env_prefix(), service_name).await?;

    let region_records = match namespace.region_prefix() {
        Some(prefix) => read_prefix(store, prefix, service_name).await?,
        None => Vec::new(),
    };

    Ok(namespace.merge_reads(env_records, region_records))
}

async fn read_prefix<S: Store>(
    store: &S,
    prefix: &str,
    service_name: &str,
) -> Result<Vec<ServiceRecord>> {
    let scope = namespace::scope(prefix, service_name);
    let entries = store.get_prefix(&scope).await?;

    Ok(entries
        .into_iter()
        .filter_map(|kv| {
            let parsed = namespace::parse_entry(&kv.key, &kv.value);

            if parsed.is_none() {
                tracing::warn!("ignoring invalid key {}", kv.key);
            }

            parsed.map(|(_, record)| record)
        })
        .collect())
}

/// Replaces the cache with a full read. Returns the number of records read.
pub(crate) async fn sync<S: Store>(
    store: &S,
    namespace: &Namespace,
    cache: &ServiceCache,
) -> Result<usize> {
    let records = fetch(store, namespace, "").await?;
    let count = records.len();
    cache.replace(records);
    Ok(count)
}

/// Runs [`sync`] every `interval` until cancelled.
pub(crate) async fn run<S: Store>(
    store: Arc<S>,
    namespace: Namespace,
    cache: Arc<ServiceCache>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match sync(store.as_ref(), &namespace, &cache).await {
            Ok(count) => tracing::debug!("resynced {count} instances"),
            Err(e) => tracing::error!("resync failed, keeping cached instances: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    fn namespace(env: &str) -> Namespace {
        Namespace::new(env, "th", "apa")
    }

    #[tokio::test]
    async fn fetch_prefers_region_outside_production() {
        let store = MemoryStore::new();
        store.insert("test-services:svc:10.0.0.1:80", "1");
        store.insert("th-test-services:svc:10.0.0.2:80", "2");
        store.insert("apa-th-test-services:svc:10.0.0.3:80", "3");

        let records = fetch(&store, &namespace("test"), "svc").await.unwrap();
        assert_eq!(records, vec![ServiceRecord::new("svc", "10.0.0.2", 80, 2)]);
    }

    #[tokio::test]
    async fn fetch_merges_in_production() {
        let store = MemoryStore::new();
        store.insert("live-services:svc:10.0.0.1:80", "1");
        store.insert("th-live-services:svc:10.0.0.2:80", "2");

        let records = fetch(&store, &namespace("live"), "svc").await.unwrap();
        assert_eq!(
            records,
            vec![
                ServiceRecord::new("svc", "10.0.0.1", 80, 1),
                ServiceRecord::new("svc", "10.0.0.2", 80, 2),
            ]
        );
    }

    #[tokio::test]
    async fn fetch_skips_invalid_keys() {
        let store = MemoryStore::new();
        store.insert("test-services:svc:10.0.0.1:80", "1");
        store.insert("test-services:svc:broken", "1");

        let records = fetch(&store, &Namespace::new("test", "", ""), "").await.unwrap();
        assert_eq!(records, vec![ServiceRecord::new("svc", "10.0.0.1", 80, 1)]);
    }

    #[tokio::test]
    async fn sync_replaces_cache() {
        let store = MemoryStore::new();
        let cache = ServiceCache::new();
        cache.upsert(ServiceRecord::new("stale", "10.0.0.9", 80, 1));

        store.insert("th-test-services:svc:10.0.0.2:80", "2");

        let count = sync(&store, &namespace("test"), &cache).await.unwrap();

        assert_eq!(count, 1);
        assert!(cache.records("stale").is_empty());
        assert_eq!(cache.records("svc").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_resyncs_every_interval() {
        let store = MemoryStore::new();
        let cache = Arc::new(ServiceCache::new());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(
            Arc::new(store.clone()),
            namespace("test"),
            cache.clone(),
            Duration::from_secs(6),
            cancel.clone(),
        ));

        store.insert("test-services:svc:10.0.0.1:80", "1");
        assert!(cache.records("svc").is_empty());

        tokio::time::sleep(Duration::from_millis(6100)).await;
        assert_eq!(cache.records("svc").len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
