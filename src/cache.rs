//! Shared state between the watchers, the reconciler and the balancer.
//!
//! Two views are kept under one lock: the smoothing weights the balancer carries
//! from call to call, and the full list of discovered records per service.
//! Every mutation bumps a revision that feeds can wait on.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::balancer::{self, WeightMap};
use crate::record::ServiceRecord;

#[derive(Default)]
struct Views {
    /// service -> address -> current smoothing weight
    smooth: HashMap<String, WeightMap>,

    /// service -> discovered records
    records: HashMap<String, Vec<ServiceRecord>>,
}

/// Per-service balancer state and discovered instances.
pub(crate) struct ServiceCache {
    views: RwLock<Views>,
    revision: watch::Sender<u64>,
}

impl Default for ServiceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceCache {
    pub(crate) fn new() -> Self {
        let (revision, _) = watch::channel(0);

        Self {
            views: RwLock::new(Views::default()),
            revision,
        }
    }

    /// Subscribes to change notifications.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Inserts or updates a record in both views.
    ///
    /// The smoothing weight of the address is reset to the configured weight.
    pub(crate) fn upsert(&self, record: ServiceRecord) {
        {
            let mut views = self.views.write();

            views
                .smooth
                .entry(record.service_name.clone())
                .or_default()
                .insert(record.address(), record.weight);

            let records = views.records.entry(record.service_name.clone()).or_default();

            match records.iter_mut().find(|known| known.same_instance(&record)) {
                Some(known) => *known = record,
                None => records.push(record),
            }
        }

        self.bump();
    }

    /// Removes exactly the instance `ip:port` of `service_name` from both views.
    pub(crate) fn remove(&self, service_name: &str, ip: &str, port: u16) {
        let address = format!("{ip}:{port}");
        self.evict(service_name, &address);
    }

    /// Removes an address from both views.
    pub(crate) fn evict(&self, service_name: &str, address: &str) {
        {
            let mut views = self.views.write();

            if let Some(current) = views.smooth.get_mut(service_name) {
                current.remove(address);
            }

            if let Some(records) = views.records.get_mut(service_name) {
                records.retain(|record| record.address() != address);
            }
        }

        self.bump();
    }

    /// Replaces both views with the given records.
    pub(crate) fn replace(&self, records: Vec<ServiceRecord>) {
        let mut fresh = Views::default();

        for record in records {
            fresh
                .smooth
                .entry(record.service_name.clone())
                .or_default()
                .insert(record.address(), record.weight);

            let known = fresh.records.entry(record.service_name.clone()).or_default();

            match known.iter_mut().find(|k| k.same_instance(&record)) {
                Some(existing) => *existing = record,
                None => known.push(record),
            }
        }

        *self.views.write() = fresh;
        self.bump();
    }

    /// Picks the next address of a service and advances its smoothing weights.
    ///
    /// The whole step runs under the write lock so concurrent picks never lose
    /// each other's updates. Returns `None` if the service has no known address.
    pub(crate) fn pick(&self, service_name: &str) -> Option<String> {
        let mut views = self.views.write();

        let configured: WeightMap = match views.records.get(service_name) {
            Some(records) => records
                .iter()
                .map(|record| (record.address(), record.weight))
                .collect(),
            None => {
                tracing::warn!("no configured weights for {service_name}, treating them as 0");
                WeightMap::new()
            }
        };

        let current = views.smooth.entry(service_name.to_string()).or_default();
        let (next, picked) = balancer::select(current, &configured);
        *current = next;

        picked
    }

    #[cfg(test)]
    pub(crate) fn current_weights(&self, service_name: &str) -> WeightMap {
        self.views
            .read()
            .smooth
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the known records of a service.
    pub(crate) fn records(&self, service_name: &str) -> Vec<ServiceRecord> {
        self.views
            .read()
            .records
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }
}
