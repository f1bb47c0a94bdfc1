//! Error types for fault-relay.

use thiserror::Error;

/// Result type alias for fault-relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while managing proxies and toxics.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No proxy with the given name.
    #[error("Proxy not found: {0}")]
    ProxyNotFound(String),

    /// A proxy with the given name already exists with a different definition.
    #[error("Proxy already exists: {0}")]
    ProxyExists(String),

    /// No toxic with the given name on the proxy.
    #[error("Toxic not found: {0}")]
    ToxicNotFound(String),

    /// A toxic with the given name already exists on the proxy.
    #[error("Toxic already exists: {0}")]
    ToxicExists(String),

    /// Malformed toxic definition or attributes.
    #[error("Invalid toxic: {0}")]
    InvalidToxic(String),

    /// Malformed proxy definition.
    #[error("Invalid proxy: {0}")]
    InvalidProxy(String),

    /// Address could not be parsed or resolved.
    #[error("Failed to resolve address: {0}")]
    AddressResolution(String),

    /// Upstream dial did not complete in time.
    #[error("Connection timeout")]
    Timeout,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
