//! Node configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, Result};

/// Port every node's broadcast listener binds to; bootstrap announcements
/// go here so peers can find each other without prior knowledge.
pub const DEFAULT_BROADCAST_PORT: u16 = 5000;

/// Configuration for a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the unicast UDP socket and the TCP chunk listener bind to.
    /// This is also the address advertised to other peers.
    pub listen_addr: SocketAddr,

    /// Port the shared broadcast channel uses for bootstrap announcements
    pub broadcast_port: u16,

    /// Directory for in-progress chunk fragments
    pub scratch_dir: PathBuf,

    /// Hop budget for flooded chunk lookups
    pub max_ttl: u8,

    /// Size of the chunk-fetch worker pool
    pub fetch_workers: usize,

    /// Size of the outbound flood-send pool
    pub flood_senders: usize,

    /// Attempts per chunk before a fetch task gives up
    pub chunk_retries: u32,

    /// Deadline for a single fetch attempt, in seconds
    pub chunk_timeout_secs: u64,

    /// Pause between fetch attempts, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5001),
            broadcast_port: DEFAULT_BROADCAST_PORT,
            scratch_dir: std::env::temp_dir().join("shoal-scratch"),
            max_ttl: 3,
            fetch_workers: 5,
            flood_senders: 8,
            chunk_retries: 3,
            chunk_timeout_secs: 5,
            retry_delay_ms: 1000,
        }
    }
}

impl NodeConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.listen_addr.is_ipv4() {
            return Err(NodeError::invalid_input(
                "listen_addr",
                "must be an IPv4 address, the wire format is IPv4-only",
            ));
        }
        if self.max_ttl == 0 {
            return Err(NodeError::invalid_input("max_ttl", "must be at least 1"));
        }
        if self.fetch_workers == 0 {
            return Err(NodeError::invalid_input(
                "fetch_workers",
                "must be at least 1",
            ));
        }
        if self.flood_senders == 0 {
            return Err(NodeError::invalid_input(
                "flood_senders",
                "must be at least 1",
            ));
        }
        if self.chunk_retries == 0 {
            return Err(NodeError::invalid_input(
                "chunk_retries",
                "must be at least 1",
            ));
        }
        if self.chunk_timeout_secs == 0 {
            return Err(NodeError::invalid_input(
                "chunk_timeout_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Deadline for a single fetch attempt
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Pause between fetch attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Destination for bootstrap announcements
    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), self.broadcast_port)
    }
}
