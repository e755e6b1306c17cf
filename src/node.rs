//! Node facade
//!
//! Ties the services together behind one handle: connection lifecycle,
//! sharing, catalog queries, and downloads. Listener tasks spawned on
//! connect feed incoming traffic to the right service and wind down on
//! disconnect through a shutdown channel.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::discovery::{DiscoveryService, Link, LinkState};
use crate::download::DownloadCoordinator;
use crate::error::{NodeError, Result};
use crate::lookup::LookupProtocol;
use crate::store::{ChunkStore, OwnedChunks};
use crate::transfer::{ChunkSignals, TransferEngine};
use crate::transport::UdpEndpoint;
use crate::types::{CatalogKind, DownloadProgress, FileRecord, NodeEvent};
use crate::wire::{is_chunk_result, FileEvent, Message, MAX_DATAGRAM};

/// Buffered events per subscriber; a slow consumer loses the oldest.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct Node {
    config: NodeConfig,
    directory: Arc<PeerDirectory>,
    store: Arc<ChunkStore>,
    discovery: Arc<DiscoveryService>,
    lookup: Arc<LookupProtocol>,
    transfer: Arc<TransferEngine>,
    coordinator: Arc<DownloadCoordinator>,
    event_tx: broadcast::Sender<NodeEvent>,
    link: RwLock<Option<Arc<Link>>>,
    state: RwLock<LinkState>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let owned = Arc::new(OwnedChunks::new());
        let directory = Arc::new(PeerDirectory::new(owned.clone()));
        let store = Arc::new(ChunkStore::new(config.scratch_dir.clone(), owned));
        let signals = Arc::new(ChunkSignals::new());

        let discovery = Arc::new(DiscoveryService::new(directory.clone(), event_tx.clone()));
        let lookup = Arc::new(LookupProtocol::new(
            directory.clone(),
            event_tx.clone(),
            &config,
        ));
        let transfer = Arc::new(TransferEngine::new(
            store.clone(),
            signals.clone(),
            event_tx.clone(),
        ));
        let coordinator = Arc::new(DownloadCoordinator::new(
            directory.clone(),
            store.clone(),
            lookup.clone(),
            transfer.clone(),
            signals,
            event_tx.clone(),
            &config,
        ));

        Ok(Arc::new(Self {
            config,
            directory,
            store,
            discovery,
            lookup,
            transfer,
            coordinator,
            event_tx,
            link: RwLock::new(None),
            state: RwLock::new(LinkState::Disconnected),
        }))
    }

    /// Join the overlay: bind sockets, announce ourselves, start the
    /// listener tasks.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != LinkState::Disconnected {
                return Err(NodeError::InvalidState {
                    action: "connect",
                    current_state: format!("{:?}", *state),
                });
            }
            *state = LinkState::Connecting;
        }

        let link = match self.discovery.connect(&self.config).await {
            Ok(link) => Arc::new(link),
            Err(e) => {
                *self.state.write() = LinkState::Disconnected;
                return Err(e);
            }
        };

        self.spawn_unicast_loop(&link);
        self.spawn_broadcast_loop(&link);
        self.spawn_accept_loop(&link);

        *self.link.write() = Some(link);
        *self.state.write() = LinkState::Connected;
        Ok(())
    }

    /// Leave the overlay. Listener tasks stop, the peer set empties,
    /// sockets close as the tasks drop their handles.
    pub fn disconnect(&self) {
        let link = self.link.write().take();
        if let Some(link) = link {
            self.discovery.disconnect(&link);
        }
        *self.state.write() = LinkState::Disconnected;
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == LinkState::Connected
    }

    /// Address this node advertises, once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.read().as_ref().map(|l| l.endpoint.local_addr())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    /// Introduce ourselves to one specific node, running the same
    /// handshake the broadcast would have started. For hosts the
    /// broadcast cannot reach.
    pub async fn bootstrap_to(&self, addr: SocketAddr) -> Result<()> {
        let ep = self.endpoint()?;
        ep.send(&Message::Bootstrap { addr: ep.local_addr() }, addr)
            .await
    }

    /// Wire up a peer directly without any handshake.
    pub fn add_manual_peer(&self, addr: SocketAddr) {
        if !addr.is_ipv4() {
            tracing::warn!("ignoring non-IPv4 peer {}", addr);
            return;
        }
        if self.local_addr() == Some(addr) {
            return;
        }
        if self.directory.add_peer(addr) {
            let _ = self.event_tx.send(NodeEvent::PeerDiscovered { addr });
        }
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.directory.peers()
    }

    pub fn catalog(&self, kind: CatalogKind) -> Vec<FileRecord> {
        self.directory.catalog(kind)
    }

    /// Files this node serves from its shared folder.
    pub fn shared_files(&self) -> Vec<FileRecord> {
        self.catalog(CatalogKind::Shared)
    }

    /// Remote files the overlay has advertised.
    pub fn known_files(&self) -> Vec<FileRecord> {
        self.catalog(CatalogKind::Known)
    }

    /// Files fetched and reassembled locally.
    pub fn downloaded_files(&self) -> Vec<FileRecord> {
        self.catalog(CatalogKind::Downloaded)
    }

    /// Where merged downloads land.
    pub fn set_destination_folder(&self, path: PathBuf) {
        self.store.set_destination(path);
    }

    /// Share every regular file in a folder. Returns how many were
    /// announced; unreadable or wire-unsafe entries are skipped with a
    /// warning rather than aborting the scan.
    pub async fn set_shared_root(&self, root: &Path) -> Result<usize> {
        self.endpoint()?;
        let mut entries = tokio::fs::read_dir(root)
            .await
            .map_err(|e| NodeError::io_at(root, e))?;
        let mut announced = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| NodeError::io_at(root, e))?
        {
            let kind = entry
                .file_type()
                .await
                .map_err(|e| NodeError::io_at(entry.path(), e))?;
            if !kind.is_file() {
                continue;
            }
            let path = entry.path();
            match self.announce_file(&path).await {
                Ok(_) => announced += 1,
                Err(e) => tracing::warn!("skipping {}: {}", path.display(), e),
            }
        }
        tracing::info!("sharing {} files from {}", announced, root.display());
        Ok(announced)
    }

    /// Share one local file: hash it, own all its chunks, tell the
    /// overlay.
    pub async fn announce_file(&self, path: &Path) -> Result<FileRecord> {
        let ep = self.endpoint()?;
        let record = self.store.announce_local_file(path, ep.local_addr()).await?;
        self.directory
            .add_file(CatalogKind::Shared, record.clone());
        self.notify_peers(&ep, FileEvent::Created, &record).await;
        let _ = self.event_tx.send(NodeEvent::FileAnnounced {
            record: record.clone(),
        });
        Ok(record)
    }

    /// Withdraw a shared file (the backing file disappeared or sharing
    /// stopped). Peers are told to forget it.
    pub async fn announce_removal(&self, file_hash: &str) -> Result<()> {
        let ep = self.endpoint()?;
        let record = self
            .directory
            .remove_file(CatalogKind::Shared, file_hash)
            .ok_or_else(|| NodeError::NotFound(file_hash.to_string()))?;
        self.store.remove_local_file(file_hash);
        self.notify_peers(&ep, FileEvent::Deleted, &record).await;
        let _ = self.event_tx.send(NodeEvent::FileRemoved {
            hash: file_hash.to_string(),
        });
        Ok(())
    }

    /// Fetch a remote file into the destination folder.
    pub async fn download_file(&self, file_hash: &str) -> Result<PathBuf> {
        let ep = self.endpoint()?;
        self.coordinator.download(&ep, file_hash).await
    }

    /// Progress of a file this node is pulling (or has pulled).
    pub fn download_progress(&self, file_hash: &str) -> Option<DownloadProgress> {
        let record = self
            .directory
            .get_file(CatalogKind::Known, file_hash)
            .or_else(|| self.directory.get_file(CatalogKind::Downloaded, file_hash))?;
        Some(self.directory.progress(file_hash, record.chunk_count))
    }

    fn endpoint(&self) -> Result<UdpEndpoint> {
        self.link
            .read()
            .as_ref()
            .map(|l| l.endpoint.clone())
            .ok_or(NodeError::InvalidState {
                action: "network operation",
                current_state: "disconnected".into(),
            })
    }

    async fn notify_peers(&self, ep: &UdpEndpoint, event: FileEvent, record: &FileRecord) {
        let msg = Message::FileNotification {
            event,
            record: record.advertised_by(record.owner),
        };
        for peer in self.directory.peers() {
            if let Err(e) = ep.send(&msg, peer).await {
                tracing::debug!("notify {} failed: {}", peer, e);
            }
        }
    }

    fn spawn_unicast_loop(self: &Arc<Self>, link: &Arc<Link>) {
        let node = self.clone();
        let socket = link.unicast.clone();
        let ep = link.endpoint.clone();
        let mut shutdown = link.shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    incoming = socket.recv_from(&mut buf) => {
                        match incoming {
                            Ok((len, from)) => {
                                node.dispatch_datagram(&ep, &buf[..len], from).await;
                            }
                            Err(e) => {
                                tracing::debug!("unicast receive error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("unicast listener stopped");
        });
    }

    fn spawn_broadcast_loop(self: &Arc<Self>, link: &Arc<Link>) {
        let node = self.clone();
        let socket = link.broadcast.clone();
        let ep = link.endpoint.clone();
        let mut shutdown = link.shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    incoming = socket.recv_from(&mut buf) => {
                        match incoming {
                            Ok((len, _)) => {
                                // only bootstraps travel on the broadcast
                                // channel; replies go out the unicast socket
                                match std::str::from_utf8(&buf[..len])
                                    .map_err(|_| NodeError::malformed("not utf-8"))
                                    .and_then(Message::decode)
                                {
                                    Ok(msg @ Message::Bootstrap { .. }) => {
                                        if let Err(e) = node.discovery.handle(&ep, &msg).await {
                                            tracing::debug!("bootstrap handling failed: {}", e);
                                        }
                                    }
                                    Ok(_) => {}
                                    Err(e) => tracing::trace!("ignored broadcast datagram: {}", e),
                                }
                            }
                            Err(e) => {
                                tracing::debug!("broadcast receive error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("broadcast listener stopped");
        });
    }

    fn spawn_accept_loop(self: &Arc<Self>, link: &Arc<Link>) {
        let Some(listener) = link.take_tcp() else {
            return;
        };
        let node = self.clone();
        let mut shutdown = link.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((mut stream, from)) => {
                                let node = node.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = node.transfer.handle_stream(&mut stream).await {
                                        tracing::debug!("stream from {} rejected: {}", from, e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::debug!("accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            tracing::debug!("stream listener stopped");
        });
    }

    async fn dispatch_datagram(self: &Arc<Self>, ep: &UdpEndpoint, bytes: &[u8], from: SocketAddr) {
        if is_chunk_result(bytes) {
            match self.transfer.handle_inline(bytes).await {
                // whoever answered a lookup is a live node worth keeping
                Ok(sender) => self.discovery.register_peer(ep, sender),
                Err(e) => tracing::debug!("inline result from {} rejected: {}", from, e),
            }
            return;
        }
        let msg = match std::str::from_utf8(bytes)
            .map_err(|_| NodeError::malformed("not utf-8"))
            .and_then(Message::decode)
        {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("malformed datagram from {}: {}", from, e);
                return;
            }
        };

        match msg {
            Message::ChunkRequest {
                hash,
                index,
                requester,
                ttl,
                visited,
            } => {
                if requester == ep.local_addr() {
                    return;
                }
                // anyone asking for chunks is a live node, in both the
                // serve and relay branches
                self.discovery.register_peer(ep, requester);
                // serving is disk plus possibly a TCP connect, keep the
                // receive loop free
                let node = self.clone();
                let ep = ep.clone();
                tokio::spawn(async move {
                    let outcome = if node.store.owned().has(&hash, index) {
                        node.transfer.serve(&ep, &hash, index, requester).await
                    } else {
                        node.lookup
                            .relay(&ep, &hash, index, requester, ttl, &visited)
                            .await
                    };
                    if let Err(e) = outcome {
                        tracing::debug!("chunk request for {} #{} failed: {}", hash, index, e);
                    }
                });
            }
            other => {
                if let Err(e) = self.discovery.handle(ep, &other).await {
                    tracing::debug!("discovery message from {} failed: {}", from, e);
                }
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let link = self.link.write().take();
        if let Some(link) = link {
            self.discovery.disconnect(&link);
        }
    }
}
