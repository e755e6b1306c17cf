//! Discovery service
//!
//! Broadcast-based bootstrap and membership: a connecting node announces
//! itself on the shared broadcast port, receivers answer with FRIEND links,
//! and the first friendship triggers a one-shot catalog catch-up. File
//! notifications keep every peer's view of remote files roughly current —
//! the catalog is eventually consistent by design.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;

use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::error::Result;
use crate::transport::{bind_broadcast, bind_unicast, routable_local_ip, UdpEndpoint};
use crate::types::{CatalogKind, NodeEvent};
use crate::wire::{FileEvent, Message};

/// Connection lifecycle of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// An active network attachment: both UDP sockets, the TCP chunk
/// listener, and the shutdown plumbing for the listener tasks.
pub struct Link {
    pub endpoint: UdpEndpoint,
    pub unicast: Arc<UdpSocket>,
    pub broadcast: Arc<UdpSocket>,
    tcp: Mutex<Option<TcpListener>>,
    pub shutdown: broadcast::Sender<()>,
    pub running: Arc<AtomicBool>,
}

impl Link {
    /// Take the TCP listener for the accept loop. Only valid once.
    pub fn take_tcp(&self) -> Option<TcpListener> {
        self.tcp.lock().take()
    }
}

pub struct DiscoveryService {
    directory: Arc<PeerDirectory>,
    event_tx: broadcast::Sender<NodeEvent>,
    /// Set once the first friend's catalog catch-up has been requested;
    /// the pull happens once per process lifetime, not per friend.
    catalog_pulled: AtomicBool,
}

impl DiscoveryService {
    pub fn new(directory: Arc<PeerDirectory>, event_tx: broadcast::Sender<NodeEvent>) -> Self {
        Self {
            directory,
            event_tx,
            catalog_pulled: AtomicBool::new(false),
        }
    }

    /// Bind both UDP endpoints and the TCP chunk listener, then announce
    /// ourselves on the broadcast channel.
    ///
    /// Any bind failure drops whatever was already acquired and surfaces
    /// the error; no half-open state survives.
    pub async fn connect(&self, config: &NodeConfig) -> Result<Link> {
        let unicast = bind_unicast(config.listen_addr)?;
        let bound = unicast
            .local_addr()
            .map_err(|e| crate::error::NodeError::io_at("unicast socket", e))?;
        // Advertise a reachable IP with the resolved port (the config may
        // ask for an ephemeral port, and a wildcard bind must not leak
        // 0.0.0.0 onto the wire).
        let advertised_ip = if config.listen_addr.ip().is_unspecified() {
            routable_local_ip(config.broadcast_target())?
        } else {
            config.listen_addr.ip()
        };
        let advertised = SocketAddr::new(advertised_ip, bound.port());

        let broadcast_sock = bind_broadcast(config.broadcast_port)?;

        let tcp = TcpListener::bind(advertised)
            .await
            .map_err(|e| crate::error::NodeError::io_at(format!("tcp bind {}", advertised), e))?;

        let endpoint = UdpEndpoint::new(Arc::new(unicast), advertised);
        let unicast = endpoint.socket_arc();

        let (shutdown, _) = broadcast::channel(1);
        let link = Link {
            endpoint: endpoint.clone(),
            unicast,
            broadcast: Arc::new(broadcast_sock),
            tcp: Mutex::new(Some(tcp)),
            shutdown,
            running: Arc::new(AtomicBool::new(true)),
        };

        // Best effort: a host without broadcast reachability can still be
        // wired up through manual peers.
        let bootstrap = Message::Bootstrap { addr: advertised };
        if let Err(e) = endpoint.send(&bootstrap, config.broadcast_target()).await {
            tracing::warn!("bootstrap announcement failed: {}", e);
        }

        tracing::info!("connected, listening on {}", advertised);
        Ok(link)
    }

    /// Tear down the attachment: stop listener loops and clear the peer
    /// set. A disconnected node starts network-empty on reconnect.
    pub fn disconnect(&self, link: &Link) {
        link.running.store(false, Ordering::SeqCst);
        let _ = link.shutdown.send(());
        self.directory.clear_peers();
        tracing::info!("disconnected from {}", link.endpoint.local_addr());
    }

    /// Handle one discovery message from the wire.
    pub async fn handle(&self, ep: &UdpEndpoint, msg: &Message) -> Result<()> {
        match msg {
            Message::Bootstrap { addr } => {
                if *addr == ep.local_addr() {
                    return Ok(());
                }
                ep.send(
                    &Message::Friend {
                        addr: ep.local_addr(),
                    },
                    *addr,
                )
                .await?;
                self.register_peer(ep, *addr);
            }

            Message::Friend { addr } => {
                self.register_peer(ep, *addr);
                if !self.catalog_pulled.swap(true, Ordering::SeqCst) {
                    ep.send(
                        &Message::FileInfoRequest {
                            addr: ep.local_addr(),
                        },
                        *addr,
                    )
                    .await?;
                }
            }

            Message::FileInfoRequest { addr } => {
                self.register_peer(ep, *addr);
                let mut records = self.directory.catalog(CatalogKind::Shared);
                records.extend(self.directory.catalog(CatalogKind::Known));
                for record in records {
                    let notification = Message::FileNotification {
                        event: FileEvent::Created,
                        record: record.advertised_by(record.owner),
                    };
                    ep.send(&notification, *addr).await?;
                }
            }

            Message::FileNotification { event, record } => {
                match event {
                    FileEvent::Created => {
                        if self.directory.add_file(CatalogKind::Known, record.clone()) {
                            tracing::debug!("learned of remote file {} ({})", record.name, record.hash);
                            let _ = self.event_tx.send(NodeEvent::FileAnnounced {
                                record: record.clone(),
                            });
                        }
                    }
                    FileEvent::Deleted => {
                        if self
                            .directory
                            .remove_file(CatalogKind::Known, &record.hash)
                            .is_some()
                        {
                            let _ = self.event_tx.send(NodeEvent::FileRemoved {
                                hash: record.hash.clone(),
                            });
                        }
                    }
                }
                self.register_peer(ep, record.owner);
            }

            // Chunk traffic is not discovery's concern
            Message::ChunkRequest { .. } => {}
        }
        Ok(())
    }

    /// Add a peer unless it is ourselves; emit an event on first sight.
    pub fn register_peer(&self, ep: &UdpEndpoint, addr: SocketAddr) {
        if addr == ep.local_addr() {
            return;
        }
        if self.directory.add_peer(addr) {
            tracing::debug!("peer discovered: {}", addr);
            let _ = self.event_tx.send(NodeEvent::PeerDiscovered { addr });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OwnedChunks;
    use crate::types::FileRecord;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn record(hash: &str, owner: SocketAddr) -> FileRecord {
        FileRecord {
            name: format!("{}.bin", hash),
            extension: "bin".into(),
            size: 10,
            chunk_count: 1,
            hash: hash.into(),
            owner,
            local_path: None,
        }
    }

    async fn service_with_endpoint() -> (DiscoveryService, UdpEndpoint, Arc<PeerDirectory>) {
        let directory = Arc::new(PeerDirectory::new(Arc::new(OwnedChunks::new())));
        let (event_tx, _) = broadcast::channel(64);
        let service = DiscoveryService::new(directory.clone(), event_tx);

        let socket = bind_unicast(addr("127.0.0.1:0")).unwrap();
        let local = socket.local_addr().unwrap();
        let ep = UdpEndpoint::new(Arc::new(socket), local);
        (service, ep, directory)
    }

    #[tokio::test]
    async fn test_bootstrap_from_self_ignored() {
        let (service, ep, directory) = service_with_endpoint().await;
        let msg = Message::Bootstrap {
            addr: ep.local_addr(),
        };
        service.handle(&ep, &msg).await.unwrap();
        assert_eq!(directory.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_bootstrap_adds_peer_and_sends_friend() {
        let (service, ep, directory) = service_with_endpoint().await;

        // a raw socket playing the remote peer
        let remote = bind_unicast(addr("127.0.0.1:0")).unwrap();
        let remote_addr = remote.local_addr().unwrap();

        service
            .handle(&ep, &Message::Bootstrap { addr: remote_addr })
            .await
            .unwrap();

        assert!(directory.has_peer(remote_addr));

        let mut buf = [0u8; 1024];
        let (len, _) = remote.recv_from(&mut buf).await.unwrap();
        let reply = Message::decode(std::str::from_utf8(&buf[..len]).unwrap()).unwrap();
        assert_eq!(
            reply,
            Message::Friend {
                addr: ep.local_addr()
            }
        );
    }

    #[tokio::test]
    async fn test_first_friend_pulls_catalog_once() {
        let (service, ep, _) = service_with_endpoint().await;

        let remote = bind_unicast(addr("127.0.0.1:0")).unwrap();
        let remote_addr = remote.local_addr().unwrap();

        service
            .handle(&ep, &Message::Friend { addr: remote_addr })
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = remote.recv_from(&mut buf).await.unwrap();
        let pull = Message::decode(std::str::from_utf8(&buf[..len]).unwrap()).unwrap();
        assert!(matches!(pull, Message::FileInfoRequest { .. }));

        // second friend must not trigger another pull
        let second = bind_unicast(addr("127.0.0.1:0")).unwrap();
        let second_addr = second.local_addr().unwrap();
        service
            .handle(&ep, &Message::Friend { addr: second_addr })
            .await
            .unwrap();

        let wait = tokio::time::timeout(std::time::Duration::from_millis(200), async {
            let mut buf = [0u8; 1024];
            second.recv_from(&mut buf).await
        })
        .await;
        assert!(wait.is_err(), "second friend should receive nothing");
    }

    #[tokio::test]
    async fn test_notification_lifecycle() {
        let (service, ep, directory) = service_with_endpoint().await;
        let owner = addr("127.0.0.1:7001");

        let created = Message::FileNotification {
            event: FileEvent::Created,
            record: record("abcd", owner),
        };
        service.handle(&ep, &created).await.unwrap();
        assert!(directory.get_file(CatalogKind::Known, "abcd").is_some());
        assert!(directory.has_peer(owner));

        let deleted = Message::FileNotification {
            event: FileEvent::Deleted,
            record: record("abcd", owner),
        };
        service.handle(&ep, &deleted).await.unwrap();
        assert!(directory.get_file(CatalogKind::Known, "abcd").is_none());

        // re-created with a new owner lands again
        let newer_owner = addr("127.0.0.1:7002");
        let recreated = Message::FileNotification {
            event: FileEvent::Created,
            record: record("abcd", newer_owner),
        };
        service.handle(&ep, &recreated).await.unwrap();
        assert_eq!(
            directory
                .get_file(CatalogKind::Known, "abcd")
                .unwrap()
                .owner,
            newer_owner
        );
    }

    #[tokio::test]
    async fn test_notification_for_own_shared_file_suppressed() {
        let (service, ep, directory) = service_with_endpoint().await;
        let rec = record("eeee", ep.local_addr());
        directory.add_file(CatalogKind::Shared, rec.clone());

        let echoed = Message::FileNotification {
            event: FileEvent::Created,
            record: rec,
        };
        service.handle(&ep, &echoed).await.unwrap();
        assert!(directory.get_file(CatalogKind::Known, "eeee").is_none());
    }
}
