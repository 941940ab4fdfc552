//! The registry facade.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::cache::ServiceCache;
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::feed;
use crate::namespace::Namespace;
use crate::reconciler;
use crate::record::ServiceRecord;
use crate::registrar::Registrar;
use crate::store::{EtcdStore, Store};
use crate::task::supervise;
use crate::watcher::{WatchContext, Watcher};

/// Registers this process's services and balances calls across discovered instances.
///
/// Background tasks (one watcher per read prefix, the periodic resync and one
/// heartbeat per registration) run until [`Registry::shutdown`] is called or the
/// registry is dropped.
pub struct Registry<S: Store = EtcdStore> {
    store: Arc<S>,
    namespace: Namespace,
    cache: Arc<ServiceCache>,
    registrar: Arc<Registrar<S>>,
    cancel: CancellationToken,
}

impl Registry<EtcdStore> {
    /// Connects to etcd and starts discovery.
    ///
    /// # Errors
    ///
    /// Fails if etcd cannot be reached or the initial read fails.
    pub async fn init(config: RegistryConfig) -> Result<Self> {
        let store = EtcdStore::connect(
            config.endpoints.clone(),
            config.dial_timeout,
            config.request_timeout,
        )
        .await?;

        Self::with_store(store, &config).await
    }
}

impl<S: Store> Registry<S> {
    /// Starts discovery on an existing store.
    ///
    /// The cache is filled from a full read and every read prefix is watched
    /// before this returns.
    ///
    /// # Errors
    ///
    /// Fails if the initial read or opening a watch fails.
    pub async fn with_store(store: S, config: &RegistryConfig) -> Result<Self> {
        let store = Arc::new(store);
        let namespace = config.namespace();
        let cache = Arc::new(ServiceCache::new());
        let cancel = CancellationToken::new();
        let registrar = Arc::new(Registrar::new(store.clone(), config, cancel.clone()));

        let count = reconciler::sync(store.as_ref(), &namespace, &cache).await?;
        tracing::info!(
            "discovered {count} instances under {}",
            namespace.env_prefix()
        );

        let mut streams = Vec::new();
        for prefix in namespace.read_prefixes() {
            let scope = crate::namespace::scope(prefix, "");
            streams.push((prefix.to_string(), store.watch_prefix(&scope).await?));
        }

        let context = WatchContext {
            store: store.clone(),
            namespace: namespace.clone(),
            cache: cache.clone(),
            registrar: registrar.clone(),
            retry_interval: config.watch_retry_interval,
            cancel: cancel.clone(),
        };

        for (prefix, stream) in streams {
            let watcher = Arc::new(Watcher::new(context.clone(), &prefix, Some(stream)));

            supervise(format!("watcher for {prefix}"), cancel.clone(), move || {
                watcher.clone().run()
            });
        }

        {
            let store = store.clone();
            let namespace = namespace.clone();
            let cache = cache.clone();
            let interval = config.sync_interval;
            let stop = cancel.clone();

            supervise("reconciler".to_string(), cancel.clone(), move || {
                reconciler::run(
                    store.clone(),
                    namespace.clone(),
                    cache.clone(),
                    interval,
                    stop.clone(),
                )
            });
        }

        Ok(Self {
            store,
            namespace,
            cache,
            registrar,
            cancel,
        })
    }

    /// Registers this process as an instance of `service_name` listening on `port`.
    ///
    /// Registering the same service and port again replaces the earlier registration.
    ///
    /// # Errors
    ///
    /// Fails if no intranet address is found or the record cannot be written
    /// under the primary prefix.
    pub async fn register(&self, service_name: &str, port: u16, weight: i64) -> Result<()> {
        self.registrar.register(service_name, port, weight).await
    }

    /// Stops renewing a registration and deletes its records.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NotRegistered`] if the service was never registered on
    /// `port`, or if the delete under the primary prefix fails.
    pub async fn unregister(&self, service_name: &str, port: u16) -> Result<()> {
        self.registrar.unregister(service_name, port).await
    }

    /// Picks an address (`ip:port`) of `service_name` by smooth weighted round robin.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoInstanceAvailable`] if no instance is known.
    pub fn get_address(&self, service_name: &str) -> Result<String> {
        self.cache
            .pick(service_name)
            .ok_or_else(|| Error::NoInstanceAvailable {
                service: service_name.to_string(),
            })
    }

    /// Removes an address from the local view until the next event or resync re-adds it.
    pub fn remove_address(&self, service_name: &str, address: &str) {
        tracing::debug!("removing {address} of {service_name} from the local view");
        self.cache.evict(service_name, address);
    }

    /// Reads the current instances of `service_name` from the store.
    ///
    /// # Errors
    ///
    /// Fails if the store read fails.
    pub async fn services(&self, service_name: &str) -> Result<Vec<ServiceRecord>> {
        let records = reconciler::fetch(self.store.as_ref(), &self.namespace, service_name).await?;

        Ok(records
            .into_iter()
            .filter(|record| record.service_name == service_name)
            .collect())
    }

    /// Rebuilds the cache from a full read now. Returns the number of instances read.
    ///
    /// # Errors
    ///
    /// Fails if the store read fails; the cache is left untouched.
    pub async fn sync(&self) -> Result<usize> {
        Ok(reconciler::sync(self.store.as_ref(), &self.namespace, &self.cache).await?)
    }

    /// Picks an address and builds a tonic [`Endpoint`] for it.
    ///
    /// # Errors
    ///
    /// Fails if no instance is known or the stored address is not a socket address.
    pub fn endpoint<F>(&self, service_name: &str, build: F) -> Result<Endpoint>
    where
        F: FnOnce(SocketAddr) -> Endpoint,
    {
        let address = self.get_address(service_name)?;

        let addr = address
            .parse::<SocketAddr>()
            .map_err(|_| Error::InvalidAddress { address })?;

        Ok(build(addr))
    }

    /// Feeds the instances of `service_name` to a tonic balance channel.
    ///
    /// The build function is called for each new address. The feed stops when the
    /// channel is closed or the registry shuts down.
    ///
    /// ```ignore
    /// let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
    /// registry.discover("greeter", tx, |addr| {
    ///     Endpoint::from_shared(format!("http://{addr}")).unwrap()
    /// });
    /// ```
    pub fn discover<F>(&self, service_name: &str, tx: Sender<Change<SocketAddr, Endpoint>>, build: F)
    where
        F: Fn(SocketAddr) -> Endpoint + Send + 'static,
    {
        feed::spawn(
            self.cache.clone(),
            service_name.to_string(),
            tx,
            build,
            self.cancel.child_token(),
        );
    }

    /// The key namespace this registry reads and writes.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Stops every background task.
    ///
    /// Records are not deleted; they expire with their leases.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("shutting down registry");
            self.cancel.cancel();
        }
    }
}

impl<S: Store> Drop for Registry<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
