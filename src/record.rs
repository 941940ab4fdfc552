//! Registration records.

use std::fmt;

/// Largest weight an instance can carry (`u32::MAX`).
pub const MAX_WEIGHT: i64 = 4_294_967_295;

/// One instance of a named service as stored in the registry.
///
/// Two records describe the same instance when service name, IP and port match;
/// the weight is configuration, not identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceRecord {
    /// The service name, e.g. a fully-qualified gRPC service.
    pub service_name: String,

    /// The instance's intranet IP address.
    pub ip: String,

    /// The port the instance serves on.
    pub port: u16,

    /// The configured load-balancing weight.
    pub weight: i64,
}

impl ServiceRecord {
    /// Creates a new record.
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
        weight: i64,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            ip: ip.into(),
            port,
            weight,
        }
    }

    /// The `ip:port` address used as the balancer key.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Returns `true` if both records describe the same instance.
    #[must_use]
    pub fn same_instance(&self, other: &Self) -> bool {
        self.service_name == other.service_name && self.ip == other.ip && self.port == other.port
    }
}

/// Clamps a weight into `0..=MAX_WEIGHT`.
#[must_use]
pub fn clamp_weight(weight: i64) -> i64 {
    weight.clamp(0, MAX_WEIGHT)
}

impl fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.service_name, self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_joins_ip_and_port() {
        let record = ServiceRecord::new("svc", "10.0.0.1", 8080, 3);
        assert_eq!(record.address(), "10.0.0.1:8080");
    }

    #[test]
    fn clamp_weight_bounds() {
        assert_eq!(clamp_weight(-3), 0);
        assert_eq!(clamp_weight(7), 7);
        assert_eq!(clamp_weight(i64::MAX), MAX_WEIGHT);
    }

    #[test]
    fn same_instance_ignores_weight() {
        let a = ServiceRecord::new("svc", "10.0.0.1", 8080, 3);
        let b = ServiceRecord::new("svc", "10.0.0.1", 8080, 7);
        let c = ServiceRecord::new("svc", "10.0.0.1", 8081, 3);
        let d = ServiceRecord::new("other", "10.0.0.1", 8080, 3);

        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
        assert!(!a.same_instance(&d));
    }

    #[test]
    fn display_names_the_instance() {
        let record = ServiceRecord::new("svc", "10.0.0.1", 8080, 3);
        assert_eq!(record.to_string(), "svc@10.0.0.1:8080");
    }
}
