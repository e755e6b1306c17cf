//! Chunk store
//!
//! Splits files into fixed-size chunks, hashes them, persists fragments
//! received over the network, and reassembles completed downloads. Also
//! hosts the owned-chunk table, the authoritative "do I have chunk i of
//! file h" predicate shared with the peer directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{NodeError, Result};
use crate::types::FileRecord;

/// Fixed chunk size: the unit of transfer and integrity checking
pub const CHUNK_SIZE: u64 = 256 * 1024;

/// Number of chunks a file of `size` bytes splits into. A zero-byte file
/// has no chunks.
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE) as u32
}

/// Hex SHA-256 digest of a byte sequence
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    to_hex(&hasher.finalize())
}

fn to_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Per-file table of chunk slots recording which chunks are locally held
/// and verified.
///
/// A file hash appears in the table only while at least one slot is
/// populated. Slot writes are set-once: a second writer for the same slot
/// is a no-op, never an error.
#[derive(Default)]
pub struct OwnedChunks {
    slots: RwLock<HashMap<String, Vec<Option<String>>>>,
}

impl OwnedChunks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark slot `index` of `file_hash` owned with the given chunk digest.
    ///
    /// Returns true if the slot transitioned empty -> populated, false if
    /// it was already owned (duplicate delivery) or the index is out of
    /// range for `total`.
    pub fn mark_owned(&self, file_hash: &str, index: u32, total: u32, chunk_hash: &str) -> bool {
        if index >= total {
            return false;
        }
        let mut slots = self.slots.write();
        let entry = slots
            .entry(file_hash.to_string())
            .or_insert_with(|| vec![None; total as usize]);
        if entry.len() < total as usize {
            entry.resize(total as usize, None);
        }
        let slot = &mut entry[index as usize];
        if slot.is_some() {
            return false;
        }
        *slot = Some(chunk_hash.to_string());
        true
    }

    /// Is chunk `index` of `file_hash` locally owned?
    pub fn has(&self, file_hash: &str, index: u32) -> bool {
        self.slots
            .read()
            .get(file_hash)
            .and_then(|v| v.get(index as usize))
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    /// Is any chunk of `file_hash` locally owned?
    pub fn has_any(&self, file_hash: &str) -> bool {
        self.slots.read().contains_key(file_hash)
    }

    /// Count of populated slots for `file_hash`
    pub fn owned_count(&self, file_hash: &str) -> u32 {
        self.slots
            .read()
            .get(file_hash)
            .map(|v| v.iter().filter(|s| s.is_some()).count() as u32)
            .unwrap_or(0)
    }

    /// Digest stored in slot `index`, if owned
    pub fn chunk_digest(&self, file_hash: &str, index: u32) -> Option<String> {
        self.slots
            .read()
            .get(file_hash)?
            .get(index as usize)?
            .clone()
    }

    /// Indices in `0..total` whose slots are still empty
    pub fn missing_indices(&self, file_hash: &str, total: u32) -> Vec<u32> {
        let slots = self.slots.read();
        let entry = slots.get(file_hash);
        (0..total)
            .filter(|&i| {
                entry
                    .and_then(|v| v.get(i as usize))
                    .map(|s| s.is_none())
                    .unwrap_or(true)
            })
            .collect()
    }

    /// Drop the whole entry for `file_hash` (file deleted or un-shared)
    pub fn remove_file(&self, file_hash: &str) {
        self.slots.write().remove(file_hash);
    }
}

/// Location and size of a physical file backing a content hash
#[derive(Debug, Clone)]
struct FileSource {
    path: PathBuf,
    size: u64,
}

/// Content-addressed chunk storage
pub struct ChunkStore {
    /// Directory for in-progress chunk fragments
    scratch_dir: PathBuf,

    /// Destination folder for assembled downloads
    destination: RwLock<Option<PathBuf>>,

    /// Hash -> physical file, for locally shared and fully downloaded files
    sources: RwLock<HashMap<String, FileSource>>,

    /// The owned-chunk table, shared with the peer directory
    owned: Arc<OwnedChunks>,
}

impl ChunkStore {
    pub fn new(scratch_dir: PathBuf, owned: Arc<OwnedChunks>) -> Self {
        Self {
            scratch_dir,
            destination: RwLock::new(None),
            sources: RwLock::new(HashMap::new()),
            owned,
        }
    }

    /// The shared owned-chunk table
    pub fn owned(&self) -> &Arc<OwnedChunks> {
        &self.owned
    }

    /// Set the folder assembled downloads land in
    pub fn set_destination(&self, path: PathBuf) {
        *self.destination.write() = Some(path);
    }

    pub fn destination(&self) -> Option<PathBuf> {
        self.destination.read().clone()
    }

    /// Total size of the file behind a content hash, if locally backed
    pub fn file_size(&self, file_hash: &str) -> Option<u64> {
        self.sources.read().get(file_hash).map(|s| s.size)
    }

    fn fragment_path(&self, file_hash: &str, index: u32) -> PathBuf {
        self.scratch_dir.join(format!("{}.chunk{}", file_hash, index))
    }

    /// Make sure the scratch area exists
    pub async fn ensure_scratch(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| NodeError::io_at(&self.scratch_dir, e))
    }

    /// Read chunk `index` of the file behind `file_hash`.
    ///
    /// Resolves, in order: a locally backed file (shared or downloaded),
    /// then a scratch fragment from an in-progress download. Returns exactly
    /// `min(CHUNK_SIZE, size - index*CHUNK_SIZE)` bytes.
    pub async fn read_chunk(&self, file_hash: &str, index: u32) -> Result<Vec<u8>> {
        let source = self.sources.read().get(file_hash).cloned();

        if let Some(source) = source {
            let total = chunk_count(source.size);
            let offset = index as u64 * CHUNK_SIZE;
            if offset >= source.size {
                return Err(NodeError::InvalidIndex {
                    index,
                    chunk_count: total,
                });
            }
            let len = CHUNK_SIZE.min(source.size - offset);

            let mut file = File::open(&source.path)
                .await
                .map_err(|e| NodeError::io_at(&source.path, e))?;
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| NodeError::io_at(&source.path, e))?;
            let mut buf = vec![0u8; len as usize];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| NodeError::io_at(&source.path, e))?;
            return Ok(buf);
        }

        let fragment = self.fragment_path(file_hash, index);
        match tokio::fs::read(&fragment).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NodeError::NotFound(file_hash.to_string()))
            }
            Err(e) => Err(NodeError::io_at(&fragment, e)),
        }
    }

    /// Persist a chunk received from the network.
    ///
    /// The single write path into the owned-chunk table for remote data.
    /// Returns `Ok(true)` if the slot was newly marked, `Ok(false)` if the
    /// chunk was already owned (duplicate delivery is a no-op). A digest
    /// disagreement leaves the fragment on disk for diagnostics but does
    /// not mark the slot.
    pub async fn save_chunk(
        &self,
        file_hash: &str,
        expected_chunk_hash: &str,
        index: u32,
        total: u32,
        bytes: &[u8],
    ) -> Result<bool> {
        if self.owned.has(file_hash, index) {
            return Ok(false);
        }

        self.ensure_scratch().await?;
        let fragment = self.fragment_path(file_hash, index);
        tokio::fs::write(&fragment, bytes)
            .await
            .map_err(|e| NodeError::io_at(&fragment, e))?;

        let actual = hash_bytes(bytes);
        if actual != expected_chunk_hash {
            return Err(NodeError::HashMismatch {
                expected: expected_chunk_hash.to_string(),
                actual,
            });
        }

        Ok(self.owned.mark_owned(file_hash, index, total, expected_chunk_hash))
    }

    /// Assemble a fully downloaded file into the destination folder.
    ///
    /// Requires every slot `0..chunk_count` to be owned. Re-verifies the
    /// whole-file digest; a mismatch removes the assembled file and is
    /// fatal for this download attempt. On success the fragments are
    /// discarded and the assembled file becomes the backing source.
    pub async fn merge(&self, record: &FileRecord) -> Result<PathBuf> {
        let dest_dir = self.destination().ok_or_else(|| NodeError::InvalidState {
            action: "merge",
            current_state: "no destination folder set".to_string(),
        })?;

        for index in 0..record.chunk_count {
            if !self.owned.has(&record.hash, index) {
                return Err(NodeError::MissingChunk { index });
            }
        }

        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| NodeError::io_at(&dest_dir, e))?;
        let out_path = dest_dir.join(&record.name);

        let mut out = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&out_path)
            .await
            .map_err(|e| NodeError::io_at(&out_path, e))?;

        let mut hasher = Sha256::new();
        for index in 0..record.chunk_count {
            let bytes = self.read_chunk(&record.hash, index).await?;
            hasher.update(&bytes);
            out.write_all(&bytes)
                .await
                .map_err(|e| NodeError::io_at(&out_path, e))?;
        }
        out.flush().await.map_err(|e| NodeError::io_at(&out_path, e))?;
        drop(out);

        let actual = to_hex(&hasher.finalize());
        if actual != record.hash {
            tokio::fs::remove_file(&out_path).await.ok();
            return Err(NodeError::HashMismatch {
                expected: record.hash.clone(),
                actual,
            });
        }

        self.sources.write().insert(
            record.hash.clone(),
            FileSource {
                path: out_path.clone(),
                size: record.size,
            },
        );

        for index in 0..record.chunk_count {
            tokio::fs::remove_file(self.fragment_path(&record.hash, index))
                .await
                .ok();
        }

        Ok(out_path)
    }

    /// Hash a local file and take ownership of every chunk up front.
    ///
    /// The whole file is already present, so all slots are self-owned
    /// immediately. Returns the record for catalog insertion.
    pub async fn announce_local_file(
        &self,
        path: &Path,
        owner: std::net::SocketAddr,
    ) -> Result<FileRecord> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| NodeError::invalid_input("path", "no usable filename"))?
            .to_string();
        if name.contains(':') || name.contains('=') {
            return Err(NodeError::invalid_input(
                "path",
                "filename may not contain ':' or '='",
            ));
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_string();

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| NodeError::io_at(path, e))?;
        let size = bytes.len() as u64;
        let total = chunk_count(size);
        let file_hash = hash_bytes(&bytes);

        for index in 0..total {
            let start = (index as u64 * CHUNK_SIZE) as usize;
            let end = ((index as u64 + 1) * CHUNK_SIZE).min(size) as usize;
            let digest = hash_bytes(&bytes[start..end]);
            self.owned.mark_owned(&file_hash, index, total, &digest);
        }

        self.sources.write().insert(
            file_hash.clone(),
            FileSource {
                path: path.to_path_buf(),
                size,
            },
        );

        Ok(FileRecord {
            name,
            extension,
            size,
            chunk_count: total,
            hash: file_hash,
            owner,
            local_path: Some(path.to_path_buf()),
        })
    }

    /// Forget a local file: drop its source entry and its owned slots
    pub fn remove_local_file(&self, file_hash: &str) {
        self.sources.write().remove(file_hash);
        self.owned.remove_file(file_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> std::net::SocketAddr {
        "127.0.0.1:5001".parse().unwrap()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn store_in(dir: &Path) -> ChunkStore {
        ChunkStore::new(dir.join("scratch"), Arc::new(OwnedChunks::new()))
    }

    #[test]
    fn test_chunk_count_algebra() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
        assert_eq!(chunk_count(600 * 1024), 3);
    }

    #[test]
    fn test_owned_chunks_set_once() {
        let owned = OwnedChunks::new();
        assert!(owned.mark_owned("h", 0, 2, "d0"));
        // second writer for the same slot is a no-op
        assert!(!owned.mark_owned("h", 0, 2, "other"));
        assert_eq!(owned.chunk_digest("h", 0).as_deref(), Some("d0"));
        assert!(owned.has("h", 0));
        assert!(!owned.has("h", 1));
        assert_eq!(owned.owned_count("h"), 1);
        assert_eq!(owned.missing_indices("h", 2), vec![1]);
    }

    #[test]
    fn test_owned_chunks_out_of_range() {
        let owned = OwnedChunks::new();
        assert!(!owned.mark_owned("h", 5, 3, "d"));
        assert!(!owned.has_any("h") || owned.owned_count("h") == 0);
    }

    #[test]
    fn test_owned_chunks_removal_drops_entry() {
        let owned = OwnedChunks::new();
        owned.mark_owned("h", 0, 1, "d");
        assert!(owned.has_any("h"));
        owned.remove_file("h");
        assert!(!owned.has_any("h"));
        assert_eq!(owned.missing_indices("h", 1), vec![0]);
    }

    #[tokio::test]
    async fn test_announce_and_read_chunk_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        // 600 KiB -> 3 chunks, last one 88 KiB
        let bytes = payload(600 * 1024);
        let file_path = dir.path().join("big.bin");
        std::fs::write(&file_path, &bytes).unwrap();

        let record = store.announce_local_file(&file_path, test_addr()).await.unwrap();
        assert_eq!(record.chunk_count, 3);
        assert_eq!(record.size, 600 * 1024);
        assert_eq!(record.hash, hash_bytes(&bytes));

        let chunk2 = store.read_chunk(&record.hash, 2).await.unwrap();
        assert_eq!(chunk2.len(), 88 * 1024);
        assert_eq!(chunk2[..], bytes[2 * CHUNK_SIZE as usize..]);
        assert_eq!(
            hash_bytes(&chunk2),
            store.owned().chunk_digest(&record.hash, 2).unwrap()
        );

        // all three slots self-owned up front
        assert_eq!(store.owned().owned_count(&record.hash), 3);
    }

    #[tokio::test]
    async fn test_read_chunk_invalid_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let file_path = dir.path().join("small.bin");
        std::fs::write(&file_path, payload(100)).unwrap();
        let record = store.announce_local_file(&file_path, test_addr()).await.unwrap();

        let err = store.read_chunk(&record.hash, 1).await.unwrap_err();
        assert!(matches!(
            err,
            NodeError::InvalidIndex {
                index: 1,
                chunk_count: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_read_chunk_unknown_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let err = store.read_chunk("deadbeef", 0).await.unwrap_err();
        assert!(matches!(err, NodeError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_save_chunk_wrong_hash_not_owned() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let bytes = payload(1000);
        let err = store
            .save_chunk("filehash", "0000", 0, 1, &bytes)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::HashMismatch { .. }));
        assert!(!store.owned().has("filehash", 0));
        // fragment still written for diagnostics
        assert!(dir.path().join("scratch").join("filehash.chunk0").exists());
    }

    #[tokio::test]
    async fn test_save_chunk_duplicate_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let bytes = payload(1000);
        let digest = hash_bytes(&bytes);
        assert!(store.save_chunk("fh", &digest, 0, 1, &bytes).await.unwrap());
        assert!(!store.save_chunk("fh", &digest, 0, 1, &bytes).await.unwrap());
        assert_eq!(store.owned().owned_count("fh"), 1);
    }

    #[tokio::test]
    async fn test_split_save_merge_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.set_destination(dir.path().join("downloads"));

        let bytes = payload(600 * 1024);
        let file_hash = hash_bytes(&bytes);
        let total = chunk_count(bytes.len() as u64);

        for index in 0..total {
            let start = (index as u64 * CHUNK_SIZE) as usize;
            let end = ((index as u64 + 1) * CHUNK_SIZE).min(bytes.len() as u64) as usize;
            let chunk = &bytes[start..end];
            store
                .save_chunk(&file_hash, &hash_bytes(chunk), index, total, chunk)
                .await
                .unwrap();
        }

        let record = FileRecord {
            name: "big.bin".into(),
            extension: "bin".into(),
            size: bytes.len() as u64,
            chunk_count: total,
            hash: file_hash.clone(),
            owner: test_addr(),
            local_path: None,
        };

        let out = store.merge(&record).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), bytes);

        // fragments discarded after assembly
        assert!(!dir
            .path()
            .join("scratch")
            .join(format!("{}.chunk0", file_hash))
            .exists());

        // the assembled file now backs reads
        let chunk0 = store.read_chunk(&file_hash, 0).await.unwrap();
        assert_eq!(chunk0[..], bytes[..CHUNK_SIZE as usize]);
    }

    #[tokio::test]
    async fn test_merge_missing_chunk_no_file_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.set_destination(dir.path().join("downloads"));

        let bytes = payload(600 * 1024);
        let file_hash = hash_bytes(&bytes);

        // Only chunk 0 saved; 1 and 2 missing
        let chunk0 = &bytes[..CHUNK_SIZE as usize];
        store
            .save_chunk(&file_hash, &hash_bytes(chunk0), 0, 3, chunk0)
            .await
            .unwrap();

        let record = FileRecord {
            name: "gap.bin".into(),
            extension: "bin".into(),
            size: bytes.len() as u64,
            chunk_count: 3,
            hash: file_hash,
            owner: test_addr(),
            local_path: None,
        };

        let err = store.merge(&record).await.unwrap_err();
        assert!(matches!(err, NodeError::MissingChunk { index: 1 }));
        assert!(!dir.path().join("downloads").join("gap.bin").exists());
    }

    #[tokio::test]
    async fn test_merge_zero_byte_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.set_destination(dir.path().join("downloads"));

        let record = FileRecord {
            name: "empty.bin".into(),
            extension: "bin".into(),
            size: 0,
            chunk_count: 0,
            hash: hash_bytes(b""),
            owner: test_addr(),
            local_path: None,
        };

        let out = store.merge(&record).await.unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_announce_rejects_wire_unsafe_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        let file_path = dir.path().join("a:b.bin");
        std::fs::write(&file_path, b"x").unwrap();
        let err = store
            .announce_local_file(&file_path, test_addr())
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidInput { .. }));
    }
}
