//! # Fault-Relay API
//!
//! HTTP control plane for creating proxies and toggling their toxics.

pub mod error;
pub mod handlers;
pub mod router;

pub use error::{ApiError, ApiResult};
pub use router::create_router;
