//! Network front end for the frame engine.
//!
//! One TCP port carries both protocols. A request that asks for a WebSocket
//! upgrade becomes an upload connection; anything else is answered as a plain
//! HTTP status request and closed.

pub mod http;
pub mod listing;
pub mod reactor;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use reactor::Reactor;

/// Default concurrent upload connections.
pub const MAX_CLIENTS: usize = 8;

/// Configuration for the reactor.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Concurrent WebSocket connections before new ones are refused.
    pub max_clients: usize,
    /// Largest upload accepted, in bytes.
    pub max_upload: usize,
    /// Per-connection reply queue depth.
    pub outbox_depth: usize,
    /// HTTP mount path for the status endpoints, e.g. `/` or `/leds`.
    pub mount: String,
    /// Directory listed by `GET <mount>/examples`.
    pub examples_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: MAX_CLIENTS,
            max_upload: ledsand_engine::LUA_CODE_LEN,
            outbox_depth: ledsand_engine::OUTBOX_DEPTH,
            mount: "/".to_string(),
            examples_dir: PathBuf::from("scripts"),
        }
    }
}

/// Operational metrics for the server.
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct ServerMetrics {
    /// WebSocket connections established.
    pub connections_accepted: Arc<AtomicU64>,
    /// Connections refused due to the client limit.
    pub connections_refused: Arc<AtomicU64>,
    /// Connections closed because an upload exceeded the size limit.
    pub oversize_closed: Arc<AtomicU64>,
    /// Replies dropped because a connection's outbox was full.
    pub notifications_dropped: Arc<AtomicU64>,
    /// Plain HTTP requests answered.
    pub http_requests: Arc<AtomicU64>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
