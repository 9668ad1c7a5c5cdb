//! Chunk Store
//!
//! Temporary storage for uploaded chunks before reassembly.
//! Chunks are addressed by `(file name, index)` and encoded as
//! `<file name>_chunk-<index>` so the index is recoverable from the key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::io::AsyncRead;

use super::types::{validate_file_name, ChunkKey, ChunkReceipt, RelayError};

/// Readable chunk payload
pub type ChunkReader = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Store a chunk, replacing any previous chunk with the same key
    async fn put(&self, key: &ChunkKey, data: &[u8]) -> Result<(), RelayError>;

    /// List every chunk key owned by `owner`, in no particular order
    async fn list(&self, owner: &str) -> Result<Vec<ChunkKey>, RelayError>;

    /// Open a chunk for reading
    async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, RelayError>;

    /// Delete a chunk. Deleting a missing chunk succeeds.
    async fn remove(&self, key: &ChunkKey) -> Result<(), RelayError>;

    /// Every stored chunk with the time it was last written
    async fn scan(&self) -> Result<Vec<(ChunkKey, DateTime<Utc>)>, RelayError>;
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Chunk store with a pluggable backend
#[derive(Clone)]
pub struct ChunkStore {
    backend: Arc<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Create with local filesystem storage under `base_path/chunks`
    pub fn with_local_storage(base_path: PathBuf) -> Self {
        Self::with_backend(Arc::new(LocalChunkStorage::new(base_path)))
    }

    /// Create with in-memory storage
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryChunkStorage::default()))
    }

    pub fn with_backend(backend: Arc<dyn ChunkStorage>) -> Self {
        Self { backend }
    }

    /// Store one chunk of `file_name`. Empty payloads are rejected before
    /// anything is written.
    pub async fn put(
        &self,
        file_name: &str,
        chunk_index: u64,
        data: &[u8],
    ) -> Result<ChunkReceipt, RelayError> {
        validate_file_name(file_name)?;
        if data.is_empty() {
            return Err(RelayError::EmptyPayload);
        }

        let key = ChunkKey::new(file_name, chunk_index);
        self.backend.put(&key, data).await?;

        tracing::debug!(
            file_name = %file_name,
            chunk_index = chunk_index,
            size = data.len(),
            "Chunk stored"
        );

        Ok(ChunkReceipt {
            file_name: file_name.to_string(),
            chunk_index,
            size: data.len() as u64,
        })
    }

    /// List the chunks of `file_name` sorted by numeric index
    pub async fn list_sorted(&self, file_name: &str) -> Result<Vec<ChunkKey>, RelayError> {
        let mut keys = self.backend.list(file_name).await?;
        keys.sort_by_key(|key| key.index);
        Ok(keys)
    }

    pub async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, RelayError> {
        self.backend.open(key).await
    }

    pub async fn remove(&self, key: &ChunkKey) -> Result<(), RelayError> {
        self.backend.remove(key).await
    }

    /// Chunk sets whose newest chunk was written before `cutoff`.
    ///
    /// Owners are judged as a whole, so an upload that is still receiving
    /// chunks keeps its early ones.
    pub async fn stale_owners(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(String, Vec<ChunkKey>)>, RelayError> {
        let mut owners: HashMap<String, (DateTime<Utc>, Vec<ChunkKey>)> = HashMap::new();

        for (key, written_at) in self.backend.scan().await? {
            let slot = owners
                .entry(key.owner.clone())
                .or_insert_with(|| (written_at, Vec::new()));
            slot.0 = slot.0.max(written_at);
            slot.1.push(key);
        }

        Ok(owners
            .into_iter()
            .filter(|(_, (newest, _))| *newest < cutoff)
            .map(|(owner, (_, keys))| (owner, keys))
            .collect())
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage
pub struct LocalChunkStorage {
    chunk_dir: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            chunk_dir: base_path.join("chunks"),
        }
    }

    fn chunk_path(&self, key: &ChunkKey) -> PathBuf {
        self.chunk_dir.join(key.encode())
    }
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn put(&self, key: &ChunkKey, data: &[u8]) -> Result<(), RelayError> {
        tokio::fs::create_dir_all(&self.chunk_dir)
            .await
            .map_err(|e| RelayError::io("create chunk dir", self.chunk_dir.display().to_string(), e))?;

        tokio::fs::write(self.chunk_path(key), data)
            .await
            .map_err(|e| RelayError::io("write chunk", key.encode(), e))
    }

    async fn list(&self, owner: &str) -> Result<Vec<ChunkKey>, RelayError> {
        let mut entries = match tokio::fs::read_dir(&self.chunk_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayError::io("list chunks", owner, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RelayError::io("list chunks", owner, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = ChunkKey::parse_for_owner(owner, name) {
                keys.push(key);
            }
        }

        Ok(keys)
    }

    async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, RelayError> {
        let file = tokio::fs::File::open(self.chunk_path(key))
            .await
            .map_err(|e| RelayError::io("open chunk", key.encode(), e))?;
        Ok(Box::new(file))
    }

    async fn remove(&self, key: &ChunkKey) -> Result<(), RelayError> {
        match tokio::fs::remove_file(self.chunk_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RelayError::io("delete chunk", key.encode(), e)),
        }
    }

    async fn scan(&self) -> Result<Vec<(ChunkKey, DateTime<Utc>)>, RelayError> {
        let dir = self.chunk_dir.display().to_string();
        let mut entries = match tokio::fs::read_dir(&self.chunk_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayError::io("scan chunks", dir, e)),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RelayError::io("scan chunks", dir.clone(), e))?
        {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(ChunkKey::parse) else {
                continue;
            };
            // Vanished between listing and stat, most likely merged
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            found.push((key, DateTime::<Utc>::from(modified)));
        }

        Ok(found)
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory chunk storage
#[derive(Default)]
pub struct MemoryChunkStorage {
    chunks: RwLock<HashMap<ChunkKey, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryChunkStorage {
    /// Number of chunks currently held
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &ChunkKey, stored_at: DateTime<Utc>) {
        if let Some(entry) = self.chunks.write().get_mut(key) {
            entry.1 = stored_at;
        }
    }
}

#[async_trait::async_trait]
impl ChunkStorage for MemoryChunkStorage {
    async fn put(&self, key: &ChunkKey, data: &[u8]) -> Result<(), RelayError> {
        self.chunks
            .write()
            .insert(key.clone(), (data.to_vec(), Utc::now()));
        Ok(())
    }

    async fn list(&self, owner: &str) -> Result<Vec<ChunkKey>, RelayError> {
        Ok(self
            .chunks
            .read()
            .keys()
            .filter(|key| key.owner == owner)
            .cloned()
            .collect())
    }

    async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, RelayError> {
        let data = self
            .chunks
            .read()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| {
                RelayError::io(
                    "open chunk",
                    key.encode(),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                )
            })?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn remove(&self, key: &ChunkKey) -> Result<(), RelayError> {
        self.chunks.write().remove(key);
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<(ChunkKey, DateTime<Utc>)>, RelayError> {
        Ok(self
            .chunks
            .read()
            .iter()
            .map(|(key, (_, stored_at))| (key.clone(), *stored_at))
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
