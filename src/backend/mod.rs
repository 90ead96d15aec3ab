//! Backend servers and per-session backend handles.
//!
//! `ServerInfo` is the shared, service-wide view of one backend server:
//! static identity plus atomically updated statistics the route selector
//! samples without locking. `BackendHandle` is one session's physical
//! connection to one server; the owning router session is the only writer.

mod handle;

pub use handle::{BackendHandle, ConnectionError};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use serde::Deserialize;

/// Role of a backend server as supplied by configuration.
///
/// Galera "joined" nodes are writable and treated identically to masters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Master,
    Slave,
    Joined,
}

impl ServerRole {
    pub fn is_master(&self) -> bool {
        matches!(self, ServerRole::Master | ServerRole::Joined)
    }

    pub fn is_slave(&self) -> bool {
        matches!(self, ServerRole::Slave)
    }
}

/// Shared descriptor and statistics for one backend server
#[derive(Debug)]
pub struct ServerInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub role: ServerRole,
    up: AtomicBool,
    /// Connections across every session of this proxy
    connections: AtomicU64,
    /// Connections opened by the router specifically
    router_connections: AtomicU64,
    /// Queries currently executing
    current_operations: AtomicU64,
    /// Replication lag in seconds, -1 when unknown
    replication_lag: AtomicI64,
}

impl ServerInfo {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16, role: ServerRole) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            role,
            up: AtomicBool::new(true),
            connections: AtomicU64::new(0),
            router_connections: AtomicU64::new(0),
            current_operations: AtomicU64::new(0),
            replication_lag: AtomicI64::new(-1),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }

    pub fn is_usable(&self) -> bool {
        self.is_up()
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.router_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
        self.router_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn operation_started(&self) {
        self.current_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_finished(&self) {
        self.current_operations.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn router_connections(&self) -> u64 {
        self.router_connections.load(Ordering::Relaxed)
    }

    pub fn current_operations(&self) -> u64 {
        self.current_operations.load(Ordering::Relaxed)
    }

    pub fn replication_lag(&self) -> i64 {
        self.replication_lag.load(Ordering::Relaxed)
    }

    pub fn set_replication_lag(&self, seconds: i64) {
        self.replication_lag.store(seconds, Ordering::Relaxed);
    }
}
