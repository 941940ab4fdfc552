//! Registry configuration.

use std::env;
use std::net::IpAddr;
use std::time::Duration;

use crate::namespace::{DEFAULT_ENV, Namespace};

/// Configuration for the service registry.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// etcd endpoints, e.g. `http://10.0.0.5:2379`.
    pub endpoints: Vec<String>,

    /// Deployment environment, e.g. `test` or `live`.
    pub env: String,

    /// Region code, e.g. `th`. Empty disables region isolation.
    pub region: String,

    /// Application type tag. Empty disables the application prefix.
    pub app_type: String,

    /// Address to register instead of the detected intranet address.
    pub advertise_ip: Option<IpAddr>,

    /// Time-to-live of registration leases, in seconds.
    pub lease_ttl: i64,

    /// How often each registration renews its lease.
    pub heartbeat_interval: Duration,

    /// How often the cache is rebuilt from a full read.
    pub sync_interval: Duration,

    /// Deadline for each store request.
    pub request_timeout: Duration,

    /// Deadline for connecting to the store.
    pub dial_timeout: Duration,

    /// Delay before a failed watch is re-opened.
    pub watch_retry_interval: Duration,
}

impl RegistryConfig {
    /// Creates a configuration with default timings.
    #[must_use]
    pub fn new<I, S>(endpoints: I, env: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            env: env.into(),
            region: String::new(),
            app_type: String::new(),
            advertise_ip: None,
            lease_ttl: 10,
            heartbeat_interval: Duration::from_secs(3),
            sync_interval: Duration::from_secs(6),
            request_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(5),
            watch_retry_interval: Duration::from_secs(1),
        }
    }

    /// Reads `ETCD_ENDPOINTS` (comma-separated), `ENV`, `REGION` and `APPTYPE`.
    ///
    /// `ENV` falls back to `dev` when unset or empty.
    #[must_use]
    pub fn from_env() -> Self {
        let endpoints = env::var("ETCD_ENDPOINTS").unwrap_or_default();
        let endpoints = endpoints
            .split(',')
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty());

        let deployment = env::var("ENV")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| {
                tracing::warn!("ENV not set, defaulting to {DEFAULT_ENV}");
                DEFAULT_ENV.to_string()
            });

        let mut config = Self::new(endpoints, deployment);
        config.region = env::var("REGION").unwrap_or_default();
        config.app_type = env::var("APPTYPE").unwrap_or_default();
        config
    }

    /// Sets the region code.
    #[must_use]
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Sets the application type tag.
    #[must_use]
    pub fn app_type(mut self, app_type: impl Into<String>) -> Self {
        self.app_type = app_type.into();
        self
    }

    /// Registers under this address instead of the detected intranet address.
    #[must_use]
    pub fn advertise_ip(mut self, ip: IpAddr) -> Self {
        self.advertise_ip = Some(ip);
        self
    }

    /// Sets the lease time-to-live in seconds.
    #[must_use]
    pub fn lease_ttl(mut self, seconds: i64) -> Self {
        self.lease_ttl = seconds;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the reconciliation interval.
    #[must_use]
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the per-request deadline.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the connect deadline.
    #[must_use]
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Sets the delay before a failed watch is re-opened.
    #[must_use]
    pub fn watch_retry_interval(mut self, interval: Duration) -> Self {
        self.watch_retry_interval = interval;
        self
    }

    /// Derives the key namespace.
    #[must_use]
    pub fn namespace(&self) -> Namespace {
        Namespace::new(&self.env, &self.region, &self.app_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_new_uses_defaults() {
        let config = RegistryConfig::new(["http://127.0.0.1:2379"], "test");

        assert_eq!(config.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
        assert_eq!(config.env, "test");
        assert!(config.region.is_empty());
        assert!(config.app_type.is_empty());
        assert!(config.advertise_ip.is_none());
        assert_eq!(config.lease_ttl, 10);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(3));
        assert_eq!(config.sync_interval, Duration::from_secs(6));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.dial_timeout, Duration::from_secs(5));
    }

    #[test]
    fn config_builder_methods() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let config = RegistryConfig::new(Vec::<String>::new(), "test")
            .region("th")
            .app_type("apa")
            .advertise_ip(ip)
            .lease_ttl(30)
            .heartbeat_interval(Duration::from_secs(10));

        assert_eq!(config.region, "th");
        assert_eq!(config.app_type, "apa");
        assert_eq!(config.advertise_ip, Some(ip));
        assert_eq!(config.lease_ttl, 30);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn config_empty_env_uses_dev_namespace() {
        let ns = RegistryConfig::new(Vec::<String>::new(), "").region("th").namespace();

        assert_eq!(ns.env_prefix(), "dev-services");
        assert_eq!(ns.primary_prefix(), "th-dev-services");
    }

    #[test]
    fn config_namespace() {
        let ns = RegistryConfig::new(Vec::<String>::new(), "TEST")
            .region("TH")
            .app_type("apa")
            .namespace();

        assert_eq!(ns.env_prefix(), "test-services");
        assert_eq!(ns.region_prefix(), Some("th-test-services"));
        assert_eq!(ns.app_prefix(), Some("apa-th-test-services"));
    }
}
