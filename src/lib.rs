#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! etcd service registration, discovery and smooth weighted load balancing for
//! [Tonic](https://docs.rs/tonic) clients.
//!
//! Each process registers the services it serves as lease-bound keys in etcd and
//! keeps the leases alive. Every process also watches the registry, keeps an
//! in-memory view of all instances, and picks an instance per call with smooth
//! weighted round robin.
//!
//! # Features
//!
//! - **Self-healing registration**: lost leases, lost connections and external
//!   deletions of this process's own keys are repaired automatically
//! - **Region isolation**: records are written under environment, region and
//!   application prefixes; outside production a region only sees its own instances
//! - **Smooth weighted round robin**: picks are interleaved in proportion to weight
//! - **Tonic integration**: build an [`Endpoint`](tonic::transport::Endpoint) per
//!   call, or feed a balance channel with [`Registry::discover`]
//!
//! # Usage
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_lb_etcd::{Registry, RegistryConfig};
//!
//! let config = RegistryConfig::new(["http://127.0.0.1:2379"], "test").region("th");
//! let registry = Registry::init(config).await?;
//!
//! // Announce this process.
//! registry.register("greeter", 50051, 10).await?;
//!
//! // Pick an instance per call...
//! let address = registry.get_address("greeter")?;
//!
//! // ...or let tonic balance across all of them.
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//! registry.discover("greeter", tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}")).unwrap()
//! });
//! ```

pub mod balancer;
mod cache;
mod config;
mod error;
mod feed;
mod namespace;
mod reconciler;
mod record;
mod registrar;
mod registry;
pub mod store;
mod task;
mod watcher;

pub use balancer::{WeightMap, select};
pub use config::RegistryConfig;
pub use error::{Error, Result};
pub use namespace::Namespace;
pub use record::{MAX_WEIGHT, ServiceRecord};
pub use registry::Registry;
pub use store::{EtcdStore, KeyValue, LeaseId, MemoryStore, Store, StoreError, WatchEvent, WatchStream};
