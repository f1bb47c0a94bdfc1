//! Connection tracking for proxied links.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::toxic::Direction;

/// Represents the state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Dialing the upstream.
    Connecting,
    /// Both sockets are open and bytes are being pumped.
    Active,
}

/// Information about a single proxied connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Unique connection identifier.
    pub id: Uuid,

    /// Name of the owning proxy.
    pub proxy: String,

    /// Client address.
    pub client_addr: String,

    /// Upstream address.
    pub upstream_addr: String,

    /// Current state.
    pub state: ConnectionState,

    /// When the client was accepted.
    pub connected_at: DateTime<Utc>,

    /// Bytes forwarded client to upstream.
    pub bytes_upstream: u64,

    /// Bytes forwarded upstream to client.
    pub bytes_downstream: u64,
}

impl ConnectionInfo {
    /// Create a new connection info.
    pub fn new(proxy: String, client_addr: String, upstream_addr: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            proxy,
            client_addr,
            upstream_addr,
            state: ConnectionState::Connecting,
            connected_at: Utc::now(),
            bytes_upstream: 0,
            bytes_downstream: 0,
        }
    }

    /// Mark the connection as active.
    pub fn set_active(&mut self) {
        self.state = ConnectionState::Active;
    }

    /// Copy the byte counters into the record.
    pub fn record(&mut self, counters: &ByteCounters) {
        self.bytes_upstream = counters.get(Direction::Upstream);
        self.bytes_downstream = counters.get(Direction::Downstream);
    }
}

/// Bytes written per direction, shared with the pumps.
#[derive(Debug, Default)]
pub struct ByteCounters {
    upstream: AtomicU64,
    downstream: AtomicU64,
}

impl ByteCounters {
    pub fn add(&self, direction: Direction, bytes: u64) {
        self.counter(direction).fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn get(&self, direction: Direction) -> u64 {
        self.counter(direction).load(Ordering::Relaxed)
    }

    fn counter(&self, direction: Direction) -> &AtomicU64 {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }
}
