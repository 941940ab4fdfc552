//! Registration of this process's services.
//!
//! Each registration owns its own store connection, lease and stop token. A
//! supervised heartbeat renews the lease and rebuilds the registration when the
//! lease or the connection is lost.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::namespace::{self, Namespace};
use crate::record::{self, ServiceRecord};
use crate::store::{LeaseId, Store, StoreError};
use crate::task::supervise;

/// Attempts made when re-registering after an external deletion.
const REREGISTER_ATTEMPTS: u32 = 3;

/// A live registration of one service instance.
pub(crate) struct Registration<S> {
    record: ServiceRecord,
    lease: AtomicI64,
    connection: Mutex<Arc<S>>,
    stop: CancellationToken,
}

impl<S> Registration<S> {
    fn lease(&self) -> LeaseId {
        self.lease.load(Ordering::SeqCst)
    }

    fn connection(&self) -> Arc<S> {
        self.connection.lock().clone()
    }

    /// `false` once unregistered, replaced or shut down.
    fn is_live(&self) -> bool {
        !self.stop.is_cancelled()
    }
}

/// Grants leases, writes records and keeps them alive.
pub(crate) struct Registrar<S> {
    store: Arc<S>,
    namespace: Namespace,
    lease_ttl: i64,
    heartbeat_interval: Duration,
    advertise_ip: Option<IpAddr>,
    registrations: Mutex<HashMap<(String, u16), Arc<Registration<S>>>>,
    cancel: CancellationToken,
}

impl<S: Store> Registrar<S> {
    pub(crate) fn new(store: Arc<S>, config: &RegistryConfig, cancel: CancellationToken) -> Self {
        Self {
            store,
            namespace: config.namespace(),
            lease_ttl: config.lease_ttl,
            heartbeat_interval: config.heartbeat_interval,
            advertise_ip: config.advertise_ip,
            registrations: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Registers this process as an instance of `service_name` on `port`.
    pub(crate) async fn register(
        self: &Arc<Self>,
        service_name: &str,
        port: u16,
        weight: i64,
    ) -> Result<()> {
        let ip = match self.advertise_ip {
            Some(ip) => ip,
            None => intranet_ip().ok_or(Error::NoIntranetAddress)?,
        };

        let clamped = record::clamp_weight(weight);
        if clamped != weight {
            tracing::warn!("weight {weight} of {service_name} is out of range, using {clamped}");
        }

        let record = ServiceRecord::new(service_name, ip.to_string(), port, clamped);
        self.start(record).await
    }

    /// Grants a lease on a fresh connection, writes the record and starts its heartbeat.
    async fn start(self: &Arc<Self>, record: ServiceRecord) -> Result<()> {
        let connection = self.store.reconnect().await?;
        let lease = connection.grant(self.lease_ttl).await?;
        write_record(&connection, &self.namespace, &record, lease).await?;

        let registration = Arc::new(Registration {
            record,
            lease: AtomicI64::new(lease),
            connection: Mutex::new(Arc::new(connection)),
            stop: self.cancel.child_token(),
        });

        let key = (
            registration.record.service_name.clone(),
            registration.record.port,
        );

        if let Some(previous) = self.registrations.lock().insert(key, registration.clone()) {
            previous.stop.cancel();
        }

        tracing::info!(
            "registered {} with lease {lease} and weight {}",
            registration.record,
            registration.record.weight
        );

        self.spawn_heartbeat(registration);
        Ok(())
    }

    fn spawn_heartbeat(&self, registration: Arc<Registration<S>>) {
        let name = format!("heartbeat for {}", registration.record);
        let stop = registration.stop.clone();
        let namespace = self.namespace.clone();
        let lease_ttl = self.lease_ttl;
        let interval = self.heartbeat_interval;

        supervise(name, stop, move || {
            heartbeat(registration.clone(), namespace.clone(), lease_ttl, interval)
        });
    }

    /// Stops the heartbeat of a registration and deletes its record.
    ///
    /// Unregistering an already stopped registration does nothing.
    pub(crate) async fn unregister(&self, service_name: &str, port: u16) -> Result<()> {
        let registration = self
            .registrations
            .lock()
            .get(&(service_name.to_string(), port))
            .cloned();

        let Some(registration) = registration else {
            return Err(Error::NotRegistered {
                service: service_name.to_string(),
                port,
            });
        };

        if !registration.is_live() {
            tracing::debug!("{} already unregistered", registration.record);
            return Ok(());
        }

        registration.stop.cancel();

        let mut outcome = Ok(());

        for prefix in self.namespace.read_prefixes() {
            let key = namespace::record_key(prefix, &registration.record);

            if let Err(e) = self.store.delete(&key).await {
                if prefix == self.namespace.primary_prefix() {
                    tracing::error!("failed to delete {key}: {e}");
                    outcome = Err(e.into());
                } else {
                    tracing::warn!("failed to delete {key}: {e}");
                }
            }
        }

        tracing::info!("unregistered {}", registration.record);
        outcome
    }

    /// Registers again after this process's own record was deleted from outside.
    ///
    /// Does nothing unless `deleted` is a live registration of this process.
    pub(crate) async fn reregister(self: &Arc<Self>, deleted: &ServiceRecord) {
        let registration = self
            .registrations
            .lock()
            .get(&(deleted.service_name.clone(), deleted.port))
            .cloned();

        let Some(registration) = registration else {
            return;
        };

        if !registration.record.same_instance(deleted) || !registration.is_live() {
            return;
        }

        tracing::info!(
            "{} was deleted from the registry, registering again",
            registration.record
        );

        registration.stop.cancel();

        for attempt in 1..=REREGISTER_ATTEMPTS {
            match self.start(registration.record.clone()).await {
                Ok(()) => return,
                Err(e) => tracing::warn!(
                    "re-registering {} failed (attempt {attempt}/{REREGISTER_ATTEMPTS}): {e}",
                    registration.record
                ),
            }
        }

        tracing::error!(
            "giving up re-registering {} after {REREGISTER_ATTEMPTS} attempts",
            registration.record
        );
    }

    #[cfg(test)]
    fn registration(&self, service_name: &str, port: u16) -> Option<Arc<Registration<S>>> {
        self.registrations
            .lock()
            .get(&(service_name.to_string(), port))
            .cloned()
    }
}

/// Writes a record under every namespace prefix.
///
/// Only a failure under the primary prefix is returned; the others are logged.
async fn write_record<S: Store>(
    store: &S,
    namespace: &Namespace,
    record: &ServiceRecord,
    lease: LeaseId,
) -> std::result::Result<(), StoreError> {
    let value = record.weight.to_string();
    let mut outcome = Ok(());

    for prefix in namespace.write_prefixes() {
        let key = namespace::record_key(prefix, record);

        if let Err(e) = store.put(&key, &value, lease).await {
            if prefix == namespace.primary_prefix() {
                tracing::error!("failed to write {key}: {e}");
                outcome = Err(e);
            } else {
                tracing::warn!("failed to write {key}: {e}");
            }
        }
    }

    outcome
}

/// Renews the registration's lease every `interval` until stopped.
async fn heartbeat<S: Store>(
    registration: Arc<Registration<S>>,
    namespace: Namespace,
    lease_ttl: i64,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = registration.stop.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let connection = registration.connection();
        let lease = registration.lease();

        match connection.keep_alive_once(lease).await {
            Ok(()) => {
                tracing::trace!("renewed lease {lease} of {}", registration.record);
            }

            Err(StoreError::LeaseNotFound) => {
                tracing::warn!(
                    "lease {lease} of {} not found, registering again",
                    registration.record
                );
                renew(&registration, &connection, &namespace, lease_ttl).await;
            }

            Err(StoreError::ConnectionLost(reason)) => {
                tracing::warn!(
                    "connection lost while renewing {}: {reason}, reconnecting",
                    registration.record
                );

                match connection.reconnect().await {
                    Ok(fresh) => {
                        let fresh = Arc::new(fresh);
                        *registration.connection.lock() = fresh.clone();
                        drop(connection);
                        renew(&registration, &fresh, &namespace, lease_ttl).await;
                    }
                    Err(e) => {
                        tracing::error!("failed to reconnect for {}: {e}", registration.record);
                    }
                }
            }

            Err(e) => {
                tracing::error!(
                    "failed to renew lease {lease} of {}, will retry: {e}",
                    registration.record
                );
            }
        }
    }
}

/// Grants a new lease and writes the record again.
async fn renew<S: Store>(
    registration: &Registration<S>,
    connection: &S,
    namespace: &Namespace,
    lease_ttl: i64,
) {
    if !registration.is_live() {
        return;
    }

    let lease = match connection.grant(lease_ttl).await {
        Ok(lease) => lease,
        Err(e) => {
            tracing::error!("failed to grant lease for {}: {e}", registration.record);
            return;
        }
    };

    let previous = registration.lease.swap(lease, Ordering::SeqCst);

    match write_record(connection, namespace, &registration.record, lease).await {
        Ok(()) => tracing::info!(
            "registered {} again with lease {lease} (was {previous})",
            registration.record
        ),
        Err(e) => tracing::error!("failed to write {} again: {e}", registration.record),
    }
}

/// Returns the first non-loopback intranet address of this host.
pub(crate) fn intranet_ip() -> Option<IpAddr> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .find(is_intranet)
}

/// Private, shared and carrier-grade NAT IPv4 ranges.
fn is_intranet(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();

            a == 10
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || (a == 100 && (64..=127).contains(&b))
        }
        IpAddr::V6(_) => false,
    }
}
