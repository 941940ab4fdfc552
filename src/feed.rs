//! Feeding discovered instances to a tonic balance channel.
//!
//! The feed waits for cache changes, compares the instances of one service
//! with what it already sent, and forwards the difference as `Change::Insert`
//! or `Change::Remove` events. Tonic's balance channel then manages the
//! connections.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::cache::ServiceCache;
use crate::record::ServiceRecord;

/// Spawns the feed for `service_name`.
pub(crate) fn spawn<F>(
    cache: Arc<ServiceCache>,
    service_name: String,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
    cancel: CancellationToken,
) where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    tokio::spawn(async move {
        feed_loop(&cache, &service_name, &tx, build, &cancel).await;
    });
}

/// Background task that sends endpoint changes until the receiver or the registry goes away.
async fn feed_loop<F>(
    cache: &ServiceCache,
    service_name: &str,
    tx: &Sender<Change<SocketAddr, Endpoint>>,
    build: F,
    cancel: &CancellationToken,
) where
    F: Fn(SocketAddr) -> Endpoint,
{
    let mut revisions = cache.subscribe();
    let mut known: HashSet<SocketAddr> = HashSet::new();

    tracing::debug!("starting balance channel feed for {service_name}");

    loop {
        let current = extract_addresses(&cache.records(service_name));

        for action in diff(&current, &mut known) {
            let change = match action {
                EndpointAction::Insert(addr) => Change::Insert(addr, build(addr)),
                EndpointAction::Remove(addr) => Change::Remove(addr),
            };

            if tx.send(change).await.is_err() {
                tracing::warn!("channel closed, stopping feed for {service_name}");
                return;
            }
        }

        tracing::debug!("{service_name}: {} endpoints", known.len());

        tokio::select! {
            () = cancel.cancelled() => return,

            changed = revisions.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

/// Represents an endpoint change action.
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointAction {
    Insert(SocketAddr),
    Remove(SocketAddr),
}

/// Brings `known` in line with `current` and returns the actions that did so.
fn diff(current: &HashSet<SocketAddr>, known: &mut HashSet<SocketAddr>) -> Vec<EndpointAction> {
    let mut actions = Vec::new();

    known.retain(|addr| {
        let keep = current.contains(addr);

        if !keep {
            tracing::debug!("removing endpoint: {addr}");
            actions.push(EndpointAction::Remove(*addr));
        }

        keep
    });

    for addr in current {
        if known.insert(*addr) {
            tracing::debug!("adding endpoint: {addr}");
            actions.push(EndpointAction::Insert(*addr));
        }
    }

    actions
}

/// Extracts socket addresses from records, skipping records whose IP does not parse.
fn extract_addresses(records: &[ServiceRecord]) -> HashSet<SocketAddr> {
    records
        .iter()
        .filter_map(|record| match record.ip.parse::<IpAddr>() {
            Ok(ip) => Some(SocketAddr::new(ip, record.port)),
            Err(_) => {
                tracing::warn!("skipping {record}: invalid IP address");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    fn record(ip: &str, port: u16) -> ServiceRecord {
        ServiceRecord::new("svc", ip, port, 1)
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    // extract_addresses tests

    #[test]
    fn extract_addresses_empty() {
        assert!(extract_addresses(&[]).is_empty());
    }

    #[test]
    fn extract_addresses_skips_invalid_ip() {
        let addrs = extract_addresses(&[record("not-an-ip", 80), record("10.0.0.1", 80)]);

        assert_eq!(addrs.len(), 1);
        assert!(addrs.contains(&addr("10.0.0.1:80")));
    }

    #[test]
    fn extract_addresses_ipv6() {
        let addrs = extract_addresses(&[record("::1", 50051), record("2001:db8::1", 50051)]);

        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains(&addr("[::1]:50051")));
        assert!(addrs.contains(&addr("[2001:db8::1]:50051")));
    }

    #[test]
    fn extract_addresses_deduplicates() {
        let addrs = extract_addresses(&[record("10.0.0.1", 80), record("10.0.0.1", 80)]);
        assert_eq!(addrs.len(), 1);
    }

    // diff tests

    #[test]
    fn diff_inserts_new_endpoints() {
        let current = HashSet::from([addr("10.0.0.1:80"), addr("10.0.0.2:80")]);
        let mut known = HashSet::new();

        let actions = diff(&current, &mut known);

        assert_eq!(actions.len(), 2);
        assert!(actions.contains(&EndpointAction::Insert(addr("10.0.0.1:80"))));
        assert!(actions.contains(&EndpointAction::Insert(addr("10.0.0.2:80"))));
        assert_eq!(known, current);
    }

    #[test]
    fn diff_skips_known_endpoints() {
        let current = HashSet::from([addr("10.0.0.1:80"), addr("10.0.0.2:80")]);
        let mut known = HashSet::from([addr("10.0.0.1:80")]);

        let actions = diff(&current, &mut known);

        assert_eq!(actions, vec![EndpointAction::Insert(addr("10.0.0.2:80"))]);
    }

    #[test]
    fn diff_removes_vanished_endpoints() {
        let current = HashSet::from([addr("10.0.0.2:80")]);
        let mut known = HashSet::from([addr("10.0.0.1:80"), addr("10.0.0.2:80")]);

        let actions = diff(&current, &mut known);

        assert_eq!(actions, vec![EndpointAction::Remove(addr("10.0.0.1:80"))]);
        assert_eq!(known, current);
    }

    #[test]
    fn diff_unchanged_returns_empty() {
        let current = HashSet::from([addr("10.0.0.1:80")]);
        let mut known = current.clone();

        assert!(diff(&current, &mut known).is_empty());
    }

    // Feed tests

    #[tokio::test]
    async fn feed_sends_inserts_and_removes() {
        let cache = Arc::new(ServiceCache::new());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(16);

        cache.upsert(record("10.0.0.1", 80));

        spawn(
            cache.clone(),
            "svc".to_string(),
            tx,
            |addr| Endpoint::from_shared(format!("http://{addr}")).unwrap(),
            cancel.clone(),
        );

        match rx.recv().await.unwrap() {
            Change::Insert(inserted, _) => assert_eq!(inserted, addr("10.0.0.1:80")),
            Change::Remove(_) => panic!("expected insert"),
        }

        cache.remove("svc", "10.0.0.1", 80);

        let removed = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        match removed {
            Change::Remove(removed) => assert_eq!(removed, addr("10.0.0.1:80")),
            Change::Insert(..) => panic!("expected remove"),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn feed_stops_when_receiver_dropped() {
        let cache = Arc::new(ServiceCache::new());
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        cache.upsert(record("10.0.0.1", 80));

        let handle = tokio::spawn(async move {
            let tx = tx;
            feed_loop(
                &cache,
                "svc",
                &tx,
                |addr| Endpoint::from_shared(format!("http://{addr}")).unwrap(),
                &CancellationToken::new(),
            )
            .await;
        });

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
