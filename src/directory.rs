//! Peer directory
//!
//! Thread-safe view of network state: the peer set, the three file
//! catalogs, and read access to the owned-chunk table. All mutation goes
//! through this narrow operation set; no caller touches the underlying
//! containers directly.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::store::OwnedChunks;
use crate::types::{CatalogKind, DownloadProgress, FileRecord};

pub struct PeerDirectory {
    peers: RwLock<HashSet<SocketAddr>>,
    shared: RwLock<HashMap<String, FileRecord>>,
    known: RwLock<HashMap<String, FileRecord>>,
    downloaded: RwLock<HashMap<String, FileRecord>>,
    owned: Arc<OwnedChunks>,
}

impl PeerDirectory {
    pub fn new(owned: Arc<OwnedChunks>) -> Self {
        Self {
            peers: RwLock::new(HashSet::new()),
            shared: RwLock::new(HashMap::new()),
            known: RwLock::new(HashMap::new()),
            downloaded: RwLock::new(HashMap::new()),
            owned,
        }
    }

    // Peer set

    /// Add a peer. Idempotent; returns true if the peer was new.
    pub fn add_peer(&self, addr: SocketAddr) -> bool {
        self.peers.write().insert(addr)
    }

    pub fn remove_peer(&self, addr: SocketAddr) -> bool {
        self.peers.write().remove(&addr)
    }

    pub fn has_peer(&self, addr: SocketAddr) -> bool {
        self.peers.read().contains(&addr)
    }

    /// Snapshot of the peer set
    pub fn peers(&self) -> Vec<SocketAddr> {
        self.peers.read().iter().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Drop every peer (a disconnected node starts network-empty)
    pub fn clear_peers(&self) {
        self.peers.write().clear();
    }

    // Catalogs

    fn catalog_lock(&self, kind: CatalogKind) -> &RwLock<HashMap<String, FileRecord>> {
        match kind {
            CatalogKind::Shared => &self.shared,
            CatalogKind::Known => &self.known,
            CatalogKind::Downloaded => &self.downloaded,
        }
    }

    /// Insert a record into a catalog.
    ///
    /// `Known` insertion is suppressed while the hash is in `Shared`:
    /// a peer never treats its own file as remote. Returns true if the
    /// record was inserted.
    pub fn add_file(&self, kind: CatalogKind, record: FileRecord) -> bool {
        if kind == CatalogKind::Known && self.shared.read().contains_key(&record.hash) {
            return false;
        }
        self.catalog_lock(kind)
            .write()
            .insert(record.hash.clone(), record);
        true
    }

    pub fn remove_file(&self, kind: CatalogKind, hash: &str) -> Option<FileRecord> {
        self.catalog_lock(kind).write().remove(hash)
    }

    pub fn get_file(&self, kind: CatalogKind, hash: &str) -> Option<FileRecord> {
        self.catalog_lock(kind).read().get(hash).cloned()
    }

    /// Snapshot of one catalog
    pub fn catalog(&self, kind: CatalogKind) -> Vec<FileRecord> {
        self.catalog_lock(kind).read().values().cloned().collect()
    }

    // Owned-chunk table

    pub fn has_chunk(&self, file_hash: &str, index: u32) -> bool {
        self.owned.has(file_hash, index)
    }

    pub fn has_any_chunk(&self, file_hash: &str) -> bool {
        self.owned.has_any(file_hash)
    }

    pub fn downloaded_chunk_count(&self, file_hash: &str) -> u32 {
        self.owned.owned_count(file_hash)
    }

    /// Progress of a download as owned / total
    pub fn progress(&self, file_hash: &str, total_chunks: u32) -> DownloadProgress {
        DownloadProgress {
            total_chunks,
            owned_chunks: self.owned.owned_count(file_hash).min(total_chunks),
        }
    }
}
