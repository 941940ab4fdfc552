//! Key namespacing for multi-region, multi-environment isolation.
//!
//! Every registration is written under up to three prefixes:
//!
//! | prefix                              | example                   |
//! |-------------------------------------|---------------------------|
//! | `{env}-services`                    | `test-services`           |
//! | `{region}-{env}-services`           | `th-test-services`        |
//! | `{app_type}-{region}-{env}-services`| `apa-th-test-services`    |
//!
//! and a full key looks like `th-test-services:wallet.BalanceService:10.0.0.7:31004`
//! with the decimal weight as value.
//!
//! Reads only look at the first two prefixes. Outside production a service
//! found under the region prefix is read from there only, so test traffic stays
//! inside its region; in production the two are merged.

use std::collections::HashSet;

use crate::record::{self, ServiceRecord};

/// Environment used when none is given.
pub(crate) const DEFAULT_ENV: &str = "dev";

/// Suffix shared by every prefix.
const PREFIX_SUFFIX: &str = "services";

/// Separator between the parts of a key.
pub(crate) const SEPARATOR: char = ':';

/// Name of the production environment.
const PRODUCTION: &str = "live";

/// The set of key prefixes derived from environment, region and application type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace {
    env: String,
    env_prefix: String,
    region_prefix: Option<String>,
    app_prefix: Option<String>,
}

impl Namespace {
    /// Derives the prefixes.
    ///
    /// Environment and region are lower-cased; the application type is used as-is.
    /// An empty environment falls back to `dev`. A prefix is only derived when all
    /// of its components are non-empty, so an empty region also disables the
    /// application prefix.
    #[must_use]
    pub fn new(env: &str, region: &str, app_type: &str) -> Self {
        let mut env = env.trim().to_lowercase();
        if env.is_empty() {
            tracing::warn!("empty environment, defaulting to {DEFAULT_ENV}");
            env = DEFAULT_ENV.to_string();
        }

        let region = region.trim().to_lowercase();
        let app_type = app_type.trim();

        let env_prefix = format!("{env}-{PREFIX_SUFFIX}");
        let region_prefix =
            (!region.is_empty()).then(|| format!("{region}-{env}-{PREFIX_SUFFIX}"));
        let app_prefix = (region_prefix.is_some() && !app_type.is_empty())
            .then(|| format!("{app_type}-{region}-{env}-{PREFIX_SUFFIX}"));

        Self {
            env,
            env_prefix,
            region_prefix,
            app_prefix,
        }
    }

    /// Returns `true` when running in the production environment.
    #[must_use]
    pub fn is_production(&self) -> bool {
        self.env == PRODUCTION
    }

    /// The single-segment environment prefix, e.g. `test-services`.
    #[must_use]
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    /// The region prefix, e.g. `th-test-services`, if a region is configured.
    #[must_use]
    pub fn region_prefix(&self) -> Option<&str> {
        self.region_prefix.as_deref()
    }

    /// The application prefix, e.g. `apa-th-test-services`, if configured.
    #[must_use]
    pub fn app_prefix(&self) -> Option<&str> {
        self.app_prefix.as_deref()
    }

    /// Prefixes that are read from and watched, narrowest last.
    pub(crate) fn read_prefixes(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.env_prefix.as_str()).chain(self.region_prefix.as_deref())
    }

    /// All prefixes a registration is written under.
    pub(crate) fn write_prefixes(&self) -> impl Iterator<Item = &str> {
        self.read_prefixes().chain(self.app_prefix.as_deref())
    }

    /// The prefix whose write or delete failure fails the whole operation.
    pub(crate) fn primary_prefix(&self) -> &str {
        self.region_prefix.as_deref().unwrap_or(&self.env_prefix)
    }

    /// Applies the read policy to the results of querying the env and region prefixes.
    ///
    /// The policy is applied per service: outside production a service found under
    /// the region prefix is taken from there only.
    pub(crate) fn merge_reads(
        &self,
        env_records: Vec<ServiceRecord>,
        region_records: Vec<ServiceRecord>,
    ) -> Vec<ServiceRecord> {
        if self.is_production() {
            let mut merged = env_records;
            merged.extend(region_records);
            return merged;
        }

        let isolated: HashSet<String> = region_records
            .iter()
            .map(|record| record.service_name.clone())
            .collect();

        env_records
            .into_iter()
            .filter(|record| !isolated.contains(&record.service_name))
            .chain(region_records)
            .collect()
    }
}

/// Builds the query or watch scope for a prefix: `{prefix}:{service}`, or `{prefix}:` for all.
pub(crate) fn scope(prefix: &str, service_name: &str) -> String {
    format!("{prefix}{SEPARATOR}{service_name}")
}

/// Builds the full key of a record under a prefix.
pub(crate) fn record_key(prefix: &str, record: &ServiceRecord) -> String {
    key(prefix, &record.service_name, &record.ip, record.port)
}

/// Builds a full key from its parts.
pub(crate) fn key(prefix: &str, service_name: &str, ip: &str, port: u16) -> String {
    format!("{prefix}{SEPARATOR}{service_name}{SEPARATOR}{ip}{SEPARATOR}{port}")
}

/// Splits a stored key into its prefix and the record it describes.
///
/// Returns `None` unless the key has exactly four parts and a valid port. The
/// weight is parsed from `value`; a value that is not an integer yields weight 0
/// and values outside `0..=MAX_WEIGHT` are clamped.
pub(crate) fn parse_entry(key: &str, value: &str) -> Option<(String, ServiceRecord)> {
    let mut parts = key.split(SEPARATOR);
    let (Some(prefix), Some(service_name), Some(ip), Some(port), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };

    let port = port.parse::<u16>().ok()?;
    let stored = value.trim().parse::<i64>().unwrap_or_else(|_| {
        tracing::warn!("non-numeric weight {value:?} stored under {key}, using 0");
        0
    });

    let weight = record::clamp_weight(stored);
    if weight != stored {
        tracing::warn!("weight {stored} stored under {key} is out of range, using {weight}");
    }

    Some((
        prefix.to_string(),
        ServiceRecord::new(service_name, ip, port, weight),
    ))
}
