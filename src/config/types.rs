//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub fleet: FleetConfig,
    pub listen: ListenConfig,
    pub timeouts: TimeoutConfig,
    pub io: IoConfig,
    pub log_level: String,
}

/// Fleet sizing and handoff-channel tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FleetConfig {
    /// Number of worker units. The Manager runs in addition to these.
    pub workers: usize,
    /// Capacity of each handoff control channel.
    pub channel_capacity: usize,
    /// When set, workers originate their own outbound connects instead of
    /// funneling every connect through the Manager. Useful for large fleets
    /// where a central connect path would bottleneck.
    pub redirect_outbound: bool,
}

/// Listening sockets owned by the Manager
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    pub addrs: Vec<SocketAddr>,
}

/// Timeouts and periodic intervals
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Default budget for a blocking outbound connect.
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// Budget for destination resolution.
    #[serde(with = "humantime_serde")]
    pub resolve: Duration,
    /// Inactivity window after which an unreferenced connection becomes an
    /// eviction candidate.
    #[serde(with = "humantime_serde")]
    pub idle: Duration,
    /// How often each worker runs its idle-eviction pass.
    #[serde(with = "humantime_serde")]
    pub eviction_interval: Duration,
    /// Grace period for draining connections at shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown: Duration,
}

/// Per-connection I/O tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IoConfig {
    /// Read buffer size per readable event.
    pub read_buffer_size: usize,
    /// Ceiling on bytes queued behind a non-writable socket before the
    /// connection is declared stuck and closed.
    pub max_queued_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fleet: FleetConfig {
                workers: 4,
                channel_capacity: 64,
                redirect_outbound: false,
            },
            listen: ListenConfig {
                addrs: vec!["127.0.0.1:5060".parse().unwrap()],
            },
            timeouts: TimeoutConfig {
                connect: Duration::from_secs(5),
                resolve: Duration::from_secs(5),
                idle: Duration::from_secs(120),
                eviction_interval: Duration::from_secs(10),
                shutdown: Duration::from_secs(30),
            },
            io: IoConfig {
                read_buffer_size: 8192,
                max_queued_bytes: 1024 * 1024,
            },
            log_level: "info".to_string(),
        }
    }
}
