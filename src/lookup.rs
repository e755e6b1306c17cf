//! Chunk lookup protocol
//!
//! CHUNK_REQUEST messages flood through the overlay with a TTL and a
//! visited set. A node that owns the requested chunk answers the original
//! requester directly; everyone else forwards to peers not yet visited,
//! decrementing the TTL. The visited set doubles as passive discovery:
//! every address a request has passed through is a live node worth
//! remembering.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, Semaphore};

use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::error::{NodeError, Result};
use crate::transport::UdpEndpoint;
use crate::types::NodeEvent;
use crate::wire::Message;

/// What a node should do with a request it cannot answer itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    /// Forward with the given decremented TTL, grown visited set, and
    /// target peers.
    Forward {
        ttl: u8,
        visited: Vec<SocketAddr>,
        targets: Vec<SocketAddr>,
    },
    /// TTL exhausted or nobody left to ask.
    Drop,
}

/// Compute the relay step for one incoming request.
///
/// Pure so the suppression behavior can be tested without sockets:
/// the TTL strictly decreases and the visited set strictly grows, so
/// every flood terminates even on cyclic topologies.
pub fn plan_relay(
    local: SocketAddr,
    peers: &[SocketAddr],
    requester: SocketAddr,
    ttl: u8,
    visited: &[SocketAddr],
) -> RelayDecision {
    if ttl <= 1 {
        return RelayDecision::Drop;
    }
    let targets: Vec<SocketAddr> = peers
        .iter()
        .copied()
        .filter(|p| *p != local && *p != requester && !visited.contains(p))
        .collect();
    if targets.is_empty() {
        return RelayDecision::Drop;
    }
    let mut next_visited = visited.to_vec();
    if !next_visited.contains(&local) {
        next_visited.push(local);
    }
    RelayDecision::Forward {
        ttl: ttl - 1,
        visited: next_visited,
        targets,
    }
}

pub struct LookupProtocol {
    directory: Arc<PeerDirectory>,
    event_tx: broadcast::Sender<NodeEvent>,
    max_ttl: u8,
    /// Caps concurrent forward sends across all in-flight relays.
    fanout: Arc<Semaphore>,
}

impl LookupProtocol {
    pub fn new(
        directory: Arc<PeerDirectory>,
        event_tx: broadcast::Sender<NodeEvent>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            directory,
            event_tx,
            max_ttl: config.max_ttl,
            fanout: Arc::new(Semaphore::new(config.flood_senders)),
        }
    }

    /// Start a lookup for one chunk: flood all current peers at full TTL.
    pub async fn send_initial(
        &self,
        ep: &UdpEndpoint,
        file_hash: &str,
        index: u32,
    ) -> Result<()> {
        let peers = self.directory.peers();
        if peers.is_empty() {
            return Err(NodeError::NoPeers);
        }
        let local = ep.local_addr();
        let msg = Message::ChunkRequest {
            hash: file_hash.to_string(),
            index,
            requester: local,
            ttl: self.max_ttl,
            visited: vec![local],
        };
        tracing::debug!(
            "requesting chunk {} of {} from {} peers",
            index,
            file_hash,
            peers.len()
        );
        self.fan_out(ep, &msg, peers).await;
        Ok(())
    }

    /// Relay a request this node cannot serve.
    ///
    /// Every address the request has touched is registered as a peer
    /// first, then the forward plan runs against the grown peer set.
    pub async fn relay(
        &self,
        ep: &UdpEndpoint,
        file_hash: &str,
        index: u32,
        requester: SocketAddr,
        ttl: u8,
        visited: &[SocketAddr],
    ) -> Result<()> {
        self.register(ep, requester).await;
        for addr in visited {
            self.register(ep, *addr).await;
        }

        let local = ep.local_addr();
        let peers = self.directory.peers();
        match plan_relay(local, &peers, requester, ttl, visited) {
            RelayDecision::Drop => {
                tracing::trace!("dropping request for {} #{} (ttl {})", file_hash, index, ttl);
            }
            RelayDecision::Forward {
                ttl,
                visited,
                targets,
            } => {
                let msg = Message::ChunkRequest {
                    hash: file_hash.to_string(),
                    index,
                    requester,
                    ttl,
                    visited,
                };
                self.fan_out(ep, &msg, targets).await;
            }
        }
        Ok(())
    }

    async fn fan_out(&self, ep: &UdpEndpoint, msg: &Message, targets: Vec<SocketAddr>) {
        for target in targets {
            let permit = match self.fanout.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let ep = ep.clone();
            let msg = msg.clone();
            tokio::spawn(async move {
                if let Err(e) = ep.send(&msg, target).await {
                    tracing::debug!("forward to {} failed: {}", target, e);
                }
                drop(permit);
            });
        }
    }

    /// Add an address the request has passed through, and send it a
    /// FRIEND so the link grows in both directions.
    async fn register(&self, ep: &UdpEndpoint, addr: SocketAddr) {
        let local = ep.local_addr();
        if addr == local {
            return;
        }
        if self.directory.add_peer(addr) {
            tracing::debug!("peer learned from lookup path: {}", addr);
            let _ = self.event_tx.send(NodeEvent::PeerDiscovered { addr });
            if let Err(e) = ep.send(&Message::Friend { addr: local }, addr).await {
                tracing::debug!("friend link to {} failed: {}", addr, e);
            }
        }
    }
}
