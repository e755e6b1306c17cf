//! Chunk transfer
//!
//! The answering side of a lookup. Small chunks ride back to the
//! requester inside a single UDP datagram; anything larger goes over a
//! short-lived TCP connection to the requester's listen address. The
//! receiving side verifies every payload against the digest in its
//! header before the chunk counts as owned.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};

use crate::error::{NodeError, Result};
use crate::store::{hash_bytes, ChunkStore};
use crate::transport::UdpEndpoint;
use crate::types::NodeEvent;
use crate::wire::{
    decode_chunk_result, encode_chunk_result, read_streamed_chunk, write_streamed_chunk,
    ChunkResultHeader, StreamedChunk, INLINE_LIMIT,
};

/// Per-chunk arrival signals.
///
/// `Notify` keeps a stored permit when fired with no waiter, so the
/// order of "chunk arrives" versus "worker starts waiting" does not
/// matter.
#[derive(Default)]
pub struct ChunkSignals {
    waiters: Mutex<HashMap<(String, u32), Arc<Notify>>>,
}

impl ChunkSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to wait on for one chunk, created on first use.
    pub fn subscribe(&self, file_hash: &str, index: u32) -> Arc<Notify> {
        self.waiters
            .lock()
            .entry((file_hash.to_string(), index))
            .or_default()
            .clone()
    }

    /// Wake the waiter for one chunk (or bank a permit for it).
    pub fn fire(&self, file_hash: &str, index: u32) {
        self.subscribe(file_hash, index).notify_one();
    }

    /// Drop all signal state for a file once its download is settled.
    pub fn clear_file(&self, file_hash: &str) {
        self.waiters.lock().retain(|(hash, _), _| hash != file_hash);
    }
}

pub struct TransferEngine {
    store: Arc<ChunkStore>,
    signals: Arc<ChunkSignals>,
    event_tx: broadcast::Sender<NodeEvent>,
    /// Active downloads this node asked for, hash to chunk count.
    /// Results for anything else are unsolicited and dropped.
    expected: RwLock<HashMap<String, u32>>,
}

impl TransferEngine {
    pub fn new(
        store: Arc<ChunkStore>,
        signals: Arc<ChunkSignals>,
        event_tx: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            store,
            signals,
            event_tx,
            expected: RwLock::new(HashMap::new()),
        }
    }

    /// Register an active download so its results are accepted.
    pub fn expect(&self, file_hash: &str, chunk_count: u32) {
        self.expected
            .write()
            .insert(file_hash.to_string(), chunk_count);
    }

    /// Stop accepting results for a file.
    pub fn unexpect(&self, file_hash: &str) {
        self.expected.write().remove(file_hash);
        self.signals.clear_file(file_hash);
    }

    /// Answer a lookup this node can satisfy: read the chunk and deliver
    /// it to the requester, inline or streamed depending on size.
    pub async fn serve(
        &self,
        ep: &UdpEndpoint,
        file_hash: &str,
        index: u32,
        requester: SocketAddr,
    ) -> Result<()> {
        let data = self.store.read_chunk(file_hash, index).await?;
        let chunk_hash = match self.store.owned().chunk_digest(file_hash, index) {
            Some(digest) => digest,
            None => hash_bytes(&data),
        };

        if data.len() <= INLINE_LIMIT {
            let header = ChunkResultHeader {
                file_hash: file_hash.to_string(),
                index,
                chunk_hash,
                chunk_size: data.len() as u32,
                sender: ep.local_addr(),
            };
            let datagram = encode_chunk_result(&header, &data);
            ep.send_bytes(&datagram, requester).await?;
            tracing::debug!(
                "served chunk {} of {} inline to {} ({} bytes)",
                index,
                file_hash,
                requester,
                data.len()
            );
        } else {
            let mut stream = TcpStream::connect(requester).await.map_err(|e| {
                NodeError::io_at(format!("connect {}", requester), e)
            })?;
            let chunk = StreamedChunk {
                file_hash: file_hash.to_string(),
                index,
                chunk_hash,
                data,
            };
            write_streamed_chunk(&mut stream, &chunk).await?;
            tracing::debug!(
                "served chunk {} of {} streamed to {} ({} bytes)",
                index,
                file_hash,
                requester,
                chunk.data.len()
            );
        }
        Ok(())
    }

    /// Ingest an inline chunk result datagram. Returns the sender's
    /// advertised address so the caller can register it as a peer.
    pub async fn handle_inline(&self, datagram: &[u8]) -> Result<SocketAddr> {
        let (header, data) = decode_chunk_result(datagram)?;
        self.accept(&header.file_hash, header.index, &header.chunk_hash, &data)
            .await?;
        Ok(header.sender)
    }

    /// Ingest a chunk arriving on a TCP connection.
    pub async fn handle_stream<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let chunk = read_streamed_chunk(stream).await?;
        self.accept(&chunk.file_hash, chunk.index, &chunk.chunk_hash, &chunk.data)
            .await
    }

    /// Verify and persist one received chunk, then wake any waiter.
    ///
    /// Unsolicited results and corrupt payloads are dropped without
    /// touching the owned table; the retry loop upstream re-requests.
    async fn accept(
        &self,
        file_hash: &str,
        index: u32,
        chunk_hash: &str,
        data: &[u8],
    ) -> Result<()> {
        let total = match self.expected.read().get(file_hash) {
            Some(total) => *total,
            None => {
                tracing::trace!("unsolicited chunk {} of {}, dropped", index, file_hash);
                return Ok(());
            }
        };

        match self.store.save_chunk(file_hash, chunk_hash, index, total, data).await {
            Ok(true) => {
                tracing::debug!("chunk {} of {} stored", index, file_hash);
                let _ = self.event_tx.send(NodeEvent::ChunkReceived {
                    hash: file_hash.to_string(),
                    index,
                });
                self.signals.fire(file_hash, index);
                Ok(())
            }
            Ok(false) => {
                // duplicate delivery, still wake the waiter
                self.signals.fire(file_hash, index);
                Ok(())
            }
            Err(NodeError::HashMismatch { expected, actual }) => {
                tracing::warn!(
                    "discarding corrupt chunk {} of {} (expected {}, got {})",
                    index,
                    file_hash,
                    expected,
                    actual
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
