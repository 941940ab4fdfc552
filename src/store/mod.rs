//! The lease-capable, prefix-watchable key-value store behind the registry.
//!
//! The registry only needs a handful of operations, captured by [`Store`].
//! [`EtcdStore`] talks to an etcd cluster; [`MemoryStore`] keeps everything in
//! process and is meant for tests and local runs.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Identifier of a granted lease.
pub type LeaseId = i64;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Stream of watch batches for a prefix.
pub type WatchStream = BoxStream<'static, Result<Vec<WatchEvent>>>;

/// Errors reported by a [`Store`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The lease expired or was revoked.
    #[error("requested lease not found")]
    LeaseNotFound,

    /// The connection to the store was lost; a new connection is needed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The request did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Any other etcd failure.
    #[error("etcd request failed: {0}")]
    Etcd(#[source] etcd_client::Error),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// A stored key and its value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// The full key.
    pub key: String,

    /// The value stored under the key.
    pub value: String,
}

impl KeyValue {
    /// Creates a new key-value pair.
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A change observed under a watched prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or updated.
    Put(KeyValue),

    /// A key was deleted, explicitly or by lease expiry.
    Delete(String),
}

impl WatchEvent {
    /// The key the event refers to.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put(kv) => &kv.key,
            Self::Delete(key) => key,
        }
    }
}

/// Operations the registry needs from its backing store.
///
/// Every call is expected to complete or fail within a bounded deadline.
#[async_trait]
pub trait Store: Send + Sync + Sized + 'static {
    /// Grants a lease with the given time-to-live in seconds.
    async fn grant(&self, ttl: i64) -> Result<LeaseId>;

    /// Renews a lease once.
    ///
    /// Fails with [`StoreError::LeaseNotFound`] if the lease no longer exists.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<()>;

    /// Writes a key attached to a lease.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    /// Reads every key starting with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Deletes exactly one key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribes to changes of every key starting with `prefix`.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream>;

    /// Opens a fresh connection to the same store.
    ///
    /// The old connection is closed when it is dropped.
    async fn reconnect(&self) -> Result<Self>;
}
