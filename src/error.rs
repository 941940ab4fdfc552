//! Error types.

use crate::store::StoreError;

/// Errors returned by the registry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No network interface with an intranet address was found.
    #[error("no intranet address found")]
    NoIntranetAddress,

    /// No instance of the service is known.
    #[error("no instance available for service {service}")]
    NoInstanceAvailable {
        /// The requested service.
        service: String,
    },

    /// The service was never registered on this port by this registry.
    #[error("service {service} is not registered on port {port}")]
    NotRegistered {
        /// The service name.
        service: String,
        /// The port.
        port: u16,
    },

    /// A stored address could not be parsed as a socket address.
    #[error("invalid instance address {address}")]
    InvalidAddress {
        /// The offending address.
        address: String,
    },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, Error>;
