//! Download coordination
//!
//! Pulls a remote file chunk by chunk: a bounded pool of workers floods
//! a lookup per missing chunk and waits on its arrival signal, retrying
//! a few times before giving up. When every chunk is owned the fragments
//! are merged, verified against the file digest, and the result lands in
//! the destination folder.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::config::NodeConfig;
use crate::directory::PeerDirectory;
use crate::error::{NodeError, Result};
use crate::lookup::LookupProtocol;
use crate::store::ChunkStore;
use crate::transfer::{ChunkSignals, TransferEngine};
use crate::transport::UdpEndpoint;
use crate::types::{CatalogKind, FileRecord, NodeEvent};

pub struct DownloadCoordinator {
    directory: Arc<PeerDirectory>,
    store: Arc<ChunkStore>,
    lookup: Arc<LookupProtocol>,
    transfer: Arc<TransferEngine>,
    signals: Arc<ChunkSignals>,
    event_tx: broadcast::Sender<NodeEvent>,
    workers: Arc<Semaphore>,
    chunk_retries: u32,
    chunk_timeout: Duration,
    retry_delay: Duration,
}

impl DownloadCoordinator {
    pub fn new(
        directory: Arc<PeerDirectory>,
        store: Arc<ChunkStore>,
        lookup: Arc<LookupProtocol>,
        transfer: Arc<TransferEngine>,
        signals: Arc<ChunkSignals>,
        event_tx: broadcast::Sender<NodeEvent>,
        config: &NodeConfig,
    ) -> Self {
        Self {
            directory,
            store,
            lookup,
            transfer,
            signals,
            event_tx,
            workers: Arc::new(Semaphore::new(config.fetch_workers)),
            chunk_retries: config.chunk_retries,
            chunk_timeout: config.chunk_timeout(),
            retry_delay: config.retry_delay(),
        }
    }

    /// Download a file known from the catalog into the destination
    /// folder. Returns the path of the merged file.
    pub async fn download(self: &Arc<Self>, ep: &UdpEndpoint, file_hash: &str) -> Result<PathBuf> {
        if let Some(existing) = self.directory.get_file(CatalogKind::Downloaded, file_hash) {
            if let Some(path) = existing.local_path {
                return Ok(path);
            }
        }
        if self.directory.get_file(CatalogKind::Shared, file_hash).is_some() {
            return Err(NodeError::InvalidState {
                action: "download",
                current_state: "file is shared from this node".into(),
            });
        }
        let record = self
            .directory
            .get_file(CatalogKind::Known, file_hash)
            .ok_or_else(|| NodeError::NotFound(file_hash.to_string()))?;

        if self.store.destination().is_none() {
            return Err(NodeError::InvalidState {
                action: "download",
                current_state: "no destination folder set".into(),
            });
        }
        if self.directory.peer_count() == 0 {
            return Err(NodeError::NoPeers);
        }

        tracing::info!(
            "downloading {} ({} chunks, {} bytes)",
            record.name,
            record.chunk_count,
            record.size
        );
        self.transfer.expect(file_hash, record.chunk_count);

        let outcome = self.fetch_all(ep, &record).await;
        match outcome {
            Ok(()) => {
                let path = self.store.merge(&record).await?;
                let mut downloaded = record.clone();
                downloaded.local_path = Some(path.clone());
                self.directory.add_file(CatalogKind::Downloaded, downloaded);
                self.transfer.unexpect(file_hash);
                tracing::info!("download of {} complete: {}", record.name, path.display());
                let _ = self.event_tx.send(NodeEvent::DownloadCompleted {
                    hash: file_hash.to_string(),
                    path: path.clone(),
                });
                Ok(path)
            }
            Err(e) => {
                self.transfer.unexpect(file_hash);
                if let NodeError::Incomplete { missing } = &e {
                    tracing::warn!(
                        "download of {} failed, {} chunks missing",
                        record.name,
                        missing.len()
                    );
                    let _ = self.event_tx.send(NodeEvent::DownloadFailed {
                        hash: file_hash.to_string(),
                        missing: missing.clone(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Run the worker pool over every missing chunk, then a final
    /// sequential sweep over stragglers before declaring failure.
    async fn fetch_all(self: &Arc<Self>, ep: &UdpEndpoint, record: &FileRecord) -> Result<()> {
        let missing = self
            .store
            .owned()
            .missing_indices(&record.hash, record.chunk_count);
        if missing.is_empty() {
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for index in missing {
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let this = self.clone();
            let ep = ep.clone();
            let hash = record.hash.clone();
            tasks.spawn(async move {
                this.fetch_chunk(&ep, &hash, index).await;
                drop(permit);
            });
        }
        while tasks.join_next().await.is_some() {}

        // a late loss can leave gaps; give each one more chance before
        // reporting failure
        let mut still_missing = self
            .store
            .owned()
            .missing_indices(&record.hash, record.chunk_count);
        if !still_missing.is_empty() {
            tracing::debug!(
                "{} chunks of {} missing after first pass, retrying",
                still_missing.len(),
                record.name
            );
            for index in still_missing {
                self.fetch_chunk(ep, &record.hash, index).await;
            }
            still_missing = self
                .store
                .owned()
                .missing_indices(&record.hash, record.chunk_count);
            if !still_missing.is_empty() {
                return Err(NodeError::Incomplete {
                    missing: still_missing,
                });
            }
        }
        Ok(())
    }

    /// Attempt one chunk with bounded retries. Returns once the chunk is
    /// owned or the attempts are spent.
    async fn fetch_chunk(&self, ep: &UdpEndpoint, file_hash: &str, index: u32) {
        for attempt in 1..=self.chunk_retries {
            if self.store.owned().has(file_hash, index) {
                return;
            }
            let notify = self.signals.subscribe(file_hash, index);
            match self.lookup.send_initial(ep, file_hash, index).await {
                Ok(()) => {}
                Err(NodeError::NoPeers) => return,
                Err(e) => {
                    tracing::debug!("lookup for chunk {} of {} failed: {}", index, file_hash, e);
                }
            }
            match timeout(self.chunk_timeout, notify.notified()).await {
                Ok(()) if self.store.owned().has(file_hash, index) => return,
                Ok(()) => {}
                Err(_) => {
                    tracing::debug!(
                        "chunk {} of {} timed out (attempt {}/{})",
                        index,
                        file_hash,
                        attempt,
                        self.chunk_retries
                    );
                }
            }
            if attempt < self.chunk_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{hash_bytes, OwnedChunks};
    use crate::transport::bind_unicast;
    use std::net::SocketAddr;
    use tempfile::TempDir;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    struct Fixture {
        _dir: TempDir,
        coordinator: Arc<DownloadCoordinator>,
        directory: Arc<PeerDirectory>,
        store: Arc<ChunkStore>,
        ep: UdpEndpoint,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let owned = Arc::new(OwnedChunks::new());
        let directory = Arc::new(PeerDirectory::new(owned.clone()));
        let store = Arc::new(ChunkStore::new(dir.path().join("scratch"), owned));
        let signals = Arc::new(ChunkSignals::new());
        let (event_tx, _) = broadcast::channel(64);

        let mut config = NodeConfig::default();
        config.chunk_timeout_secs = 1;
        config.retry_delay_ms = 10;
        config.chunk_retries = 1;

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
            lookup,
            transfer,
            signals,
            event_tx,
            &config,
        ));

        let socket = bind_unicast(addr("127.0.0.1:0")).unwrap();
        let local = socket.local_addr().unwrap();
        let ep = UdpEndpoint::new(Arc::new(socket), local);

        Fixture {
            _dir: dir,
            coordinator,
            directory,
            store,
            ep,
        }
    }

    fn known_record(payload: &[u8], owner: SocketAddr) -> FileRecord {
        FileRecord {
            name: "doc.txt".into(),
            extension: "txt".into(),
            size: payload.len() as u64,
            chunk_count: crate::store::chunk_count(payload.len() as u64),
            hash: hash_bytes(payload),
            owner,
            local_path: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_hash_is_not_found() {
        let f = fixture().await;
        f.store.set_destination(f._dir.path().join("out"));
        let err = f.coordinator.download(&f.ep, "nope").await.unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_destination_rejected() {
        let f = fixture().await;
        let record = known_record(b"hello", addr("127.0.0.1:7000"));
        let hash = record.hash.clone();
        f.directory.add_file(CatalogKind::Known, record);
        let err = f.coordinator.download(&f.ep, &hash).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_no_peers_short_circuits() {
        let f = fixture().await;
        f.store.set_destination(f._dir.path().join("out"));
        let record = known_record(b"hello", addr("127.0.0.1:7000"));
        let hash = record.hash.clone();
        f.directory.add_file(CatalogKind::Known, record);
        let err = f.coordinator.download(&f.ep, &hash).await.unwrap_err();
        assert!(matches!(err, NodeError::NoPeers));
    }

    #[tokio::test]
    async fn test_already_owned_chunks_merge_without_network() {
        let f = fixture().await;
        let out = f._dir.path().join("out");
        tokio::fs::create_dir_all(&out).await.unwrap();
        f.store.set_destination(out.clone());

        let payload = vec![5u8; 1000];
        let record = known_record(&payload, addr("127.0.0.1:7000"));
        let hash = record.hash.clone();
        f.directory.add_file(CatalogKind::Known, record);
        f.directory.add_peer(addr("127.0.0.1:7000"));

        // chunk already on disk from an earlier interrupted session
        f.store
            .save_chunk(&hash, &hash_bytes(&payload), 0, 1, &payload)
            .await
            .unwrap();

        let path = f.coordinator.download(&f.ep, &hash).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), payload);
        assert!(f
            .directory
            .get_file(CatalogKind::Downloaded, &hash)
            .unwrap()
            .local_path
            .is_some());
    }

    #[tokio::test]
    async fn test_zero_byte_file_merges_immediately() {
        let f = fixture().await;
        let out = f._dir.path().join("out");
        tokio::fs::create_dir_all(&out).await.unwrap();
        f.store.set_destination(out);

        let record = known_record(b"", addr("127.0.0.1:7000"));
        let hash = record.hash.clone();
        f.directory.add_file(CatalogKind::Known, record);
        f.directory.add_peer(addr("127.0.0.1:7000"));

        let path = f.coordinator.download(&f.ep, &hash).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_chunks_report_missing() {
        let f = fixture().await;
        let out = f._dir.path().join("out");
        tokio::fs::create_dir_all(&out).await.unwrap();
        f.store.set_destination(out);

        // a peer that never answers
        let silent = bind_unicast(addr("127.0.0.1:0")).unwrap();
        let silent_addr = silent.local_addr().unwrap();
        f.directory.add_peer(silent_addr);

        let payload = vec![3u8; 100];
        let record = known_record(&payload, silent_addr);
        let hash = record.hash.clone();
        f.directory.add_file(CatalogKind::Known, record);

        let err = f.coordinator.download(&f.ep, &hash).await.unwrap_err();
        match err {
            NodeError::Incomplete { missing } => assert_eq!(missing, vec![0]),
            other => panic!("unexpected error: {}", other),
        }
    }
}
