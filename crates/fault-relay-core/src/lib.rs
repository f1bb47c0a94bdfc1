//! # Fault-Relay Core
//!
//! Core library for the fault-relay proxy.
//! Provides named TCP proxies whose links pass every byte through
//! per-direction toxic chains (latency, timeouts, resets, bandwidth caps).

pub mod chain;
pub mod collection;
pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod proxy;
pub mod toxic;

pub use chain::{ProxyToxics, ToxicChain};
pub use collection::ProxyCollection;
pub use config::{Config, LimitsConfig, LoggingConfig, ProxyConfig, ServerConfig};
pub use connection::{ConnectionInfo, ConnectionState};
pub use error::{Error, Result};
pub use proxy::{Proxy, ProxyInfo, ProxyUpdate};
pub use toxic::{Direction, Toxic, ToxicKind, ToxicRequest, ToxicUpdate};
