//! Configuration for the node's RPC actor.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::common::{Id, DEFAULT_TTL};

use super::socket::DEFAULT_REQUEST_TIMEOUT;

/// Maximum peers per bucket, and the lookup/replication fan-out width.
pub const DEFAULT_KSIZE: usize = 3;

/// Peers probed concurrently per crawl round.
pub const DEFAULT_ALPHA: usize = 2;

/// How often the maintenance pass refreshes stale buckets and re-pushes
/// stored keys.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// A bucket untouched for this long becomes a refresh target. Short on
/// purpose; these nodes target LAN and simulation settings.
pub const DEFAULT_BUCKET_STALE_AFTER: Duration = Duration::from_secs(10);

/// How often the routing state snapshot is written, when a path is set.
pub const DEFAULT_STATE_SAVE_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct Config {
    /// This node's id on the network. Defaults to a random [Id], except
    /// when restored from a saved state snapshot.
    pub id: Option<Id>,
    /// UDP port to listen on. Defaults to `0` (os assigned port).
    pub port: u16,
    /// Interface to bind to. Defaults to [Ipv4Addr::UNSPECIFIED].
    pub interface: Ipv4Addr,
    /// Peers to contact on startup to join the network.
    pub bootstrap: Vec<SocketAddrV4>,
    /// Defaults to [DEFAULT_KSIZE].
    pub ksize: usize,
    /// Defaults to [DEFAULT_ALPHA].
    pub alpha: usize,
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT].
    pub request_timeout: Duration,
    /// Defaults to [DEFAULT_REFRESH_INTERVAL].
    pub refresh_interval: Duration,
    /// Defaults to [DEFAULT_BUCKET_STALE_AFTER].
    pub bucket_stale_after: Duration,
    /// How long stored values live before the cull pass drops them.
    /// Defaults to [DEFAULT_TTL].
    pub storage_ttl: Duration,
    /// Where to periodically snapshot the routing state. `None` (the
    /// default) disables snapshots.
    pub state_path: Option<PathBuf>,
    /// Defaults to [DEFAULT_STATE_SAVE_INTERVAL].
    pub state_save_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            id: None,
            port: 0,
            interface: Ipv4Addr::UNSPECIFIED,
            bootstrap: Vec::new(),
            ksize: DEFAULT_KSIZE,
            alpha: DEFAULT_ALPHA,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            bucket_stale_after: DEFAULT_BUCKET_STALE_AFTER,
            storage_ttl: DEFAULT_TTL,
            state_path: None,
            state_save_interval: DEFAULT_STATE_SAVE_INTERVAL,
        }
    }
}
