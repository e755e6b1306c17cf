//! Core types shared across the node

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Metadata for a file in the overlay.
///
/// Identity is the content hash: two records with equal `hash` describe the
/// same file even if the filename has drifted between peers. Records are
/// immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Filename as shared (no directory components)
    pub name: String,

    /// File extension, without the dot ("pdf", "iso", ...). Empty if none.
    pub extension: String,

    /// Total size in bytes
    pub size: u64,

    /// Number of fixed-size chunks the file splits into
    pub chunk_count: u32,

    /// Hex SHA-256 of the whole file; the catalog and ownership key
    pub hash: String,

    /// Listen address of the peer that hosts the file
    pub owner: SocketAddr,

    /// Where the file lives on this machine, if it does
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub local_path: Option<PathBuf>,
}

impl FileRecord {
    /// Copy of this record with a different owner and no local path,
    /// suitable for gossiping to other peers.
    pub fn advertised_by(&self, owner: SocketAddr) -> Self {
        Self {
            owner,
            local_path: None,
            ..self.clone()
        }
    }
}

/// Which of the three catalogs a record lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    /// Files this peer physically hosts and serves
    Shared,
    /// Files advertised by others, not yet downloaded
    Known,
    /// Files fetched and reassembled locally
    Downloaded,
}

/// Events emitted by the node for external observers (GUI, logs)
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A new peer entered the peer set
    PeerDiscovered { addr: SocketAddr },

    /// A remote file appeared in the known catalog
    FileAnnounced { record: FileRecord },

    /// A remote file left the known catalog
    FileRemoved { hash: String },

    /// A chunk of an in-progress download was verified and stored
    ChunkReceived { hash: String, index: u32 },

    /// A download was fully assembled and verified
    DownloadCompleted { hash: String, path: PathBuf },

    /// A download gave up with chunks still missing
    DownloadFailed { hash: String, missing: Vec<u32> },
}

/// Progress of a single file download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Total number of chunks in the file
    pub total_chunks: u32,
    /// Chunks locally owned and verified
    pub owned_chunks: u32,
}

impl DownloadProgress {
    /// Percentage complete, 0.0 to 100.0
    pub fn percentage(&self) -> f64 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.owned_chunks as f64 / self.total_chunks as f64) * 100.0
    }

    /// Whether every chunk is owned
    pub fn is_complete(&self) -> bool {
        self.owned_chunks >= self.total_chunks
    }
}
