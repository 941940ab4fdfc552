//! etcd-backed [`Store`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions, WatchResponse,
};
use futures::StreamExt;
use futures::stream;

use super::{KeyValue, LeaseId, Result, Store, StoreError, WatchEvent, WatchStream};

/// Message etcd returns for an expired or revoked lease.
const LEASE_NOT_FOUND: &str = "requested lease not found";

/// Fragment of the message etcd returns when a request timed out on a lost connection.
const CONNECTION_LOST: &str = "connection lost";

/// A connection to an etcd cluster.
///
/// Every request runs under `request_timeout`; connecting runs under `dial_timeout`.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    endpoints: Vec<String>,
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("endpoints", &self.endpoints)
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connects to the given endpoints.
    ///
    /// # Errors
    ///
    /// Fails if no connection can be established within `dial_timeout`.
    pub async fn connect(
        endpoints: Vec<String>,
        dial_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(dial_timeout)
            .with_timeout(request_timeout);

        let client = tokio::time::timeout(
            dial_timeout,
            Client::connect(endpoints.clone(), Some(options)),
        )
        .await
        .map_err(|_| StoreError::Timeout(dial_timeout))??;

        tracing::debug!("connected to etcd at {endpoints:?}");

        Ok(Self {
            client,
            endpoints,
            dial_timeout,
            request_timeout,
        })
    }

    /// The endpoints this store connects to.
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Runs a request under the request deadline.
    async fn deadline<T, F>(&self, request: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, etcd_client::Error>>,
    {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .map_err(|_| StoreError::Timeout(self.request_timeout))?
            .map_err(StoreError::from)
    }
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        match &e {
            etcd_client::Error::GRpcStatus(status) => {
                let message = status.message();

                if message.contains(LEASE_NOT_FOUND) {
                    Self::LeaseNotFound
                } else if message.contains(CONNECTION_LOST) {
                    Self::ConnectionLost(message.to_string())
                } else {
                    Self::Etcd(e)
                }
            }

            etcd_client::Error::TransportError(_) => Self::ConnectionLost(e.to_string()),

            _ => Self::Etcd(e),
        }
    }
}

#[async_trait]
impl Store for EtcdStore {
    async fn grant(&self, ttl: i64) -> Result<LeaseId> {
        let mut client = self.client.clone();
        let lease = self.deadline(client.lease_grant(ttl, None)).await?;
        Ok(lease.id())
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();

        let renewed = self
            .deadline(async move {
                let (mut keeper, mut responses) = client.lease_keep_alive(lease).await?;
                keeper.keep_alive().await?;
                responses.message().await
            })
            .await?;

        // etcd answers a keep-alive for an unknown lease with a zero TTL instead of an error.
        match renewed {
            Some(response) if response.ttl() > 0 => Ok(()),
            Some(_) => Err(StoreError::LeaseNotFound),
            None => Err(StoreError::ConnectionLost(
                "keep-alive stream closed".to_string(),
            )),
        }
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut client = self.client.clone();
        let options = PutOptions::new().with_lease(lease);
        self.deadline(client.put(key, value, Some(options))).await?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let options = GetOptions::new().with_prefix();
        let response = self.deadline(client.get(prefix, Some(options))).await?;

        let mut entries = Vec::with_capacity(response.kvs().len());

        for kv in response.kvs() {
            match (kv.key_str(), kv.value_str()) {
                (Ok(key), Ok(value)) => entries.push(KeyValue::new(key, value)),
                _ => tracing::warn!("skipping non-UTF-8 entry under {prefix}"),
            }
        }

        Ok(entries)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        self.deadline(client.delete(key, None)).await?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let options = WatchOptions::new().with_prefix();
        let (watcher, responses) = self.deadline(client.watch(prefix, Some(options))).await?;

        // The watcher handle travels with the stream; dropping it cancels the watch.
        let stream = stream::unfold(
            (watcher, responses),
            |(watcher, mut responses)| async move {
                let batch = match responses.message().await {
                    Ok(Some(response)) if response.canceled() => {
                        Err(StoreError::Other(format!(
                            "watch canceled by server: {}",
                            response.cancel_reason()
                        )))
                    }
                    Ok(Some(response)) => Ok(watch_events(&response)),
                    Ok(None) => return None,
                    Err(e) => Err(StoreError::from(e)),
                };

                Some((batch, (watcher, responses)))
            },
        );

        Ok(stream.boxed())
    }

    async fn reconnect(&self) -> Result<Self> {
        Self::connect(
            self.endpoints.clone(),
            self.dial_timeout,
            self.request_timeout,
        )
        .await
    }
}

/// Converts one watch response into store events, skipping non-UTF-8 keys.
fn watch_events(response: &WatchResponse) -> Vec<WatchEvent> {
    response
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let key = kv.key_str().ok()?.to_string();

            match event.event_type() {
                EventType::Put => {
                    let value = kv.value_str().ok()?.to_string();
                    Some(WatchEvent::Put(KeyValue { key, value }))
                }
                EventType::Delete => Some(WatchEvent::Delete(key)),
            }
        })
        .collect()
}
