//! Artifact Store
//!
//! Holds merged files. Artifacts are addressed by an opaque storage key and
//! are only ever reached through the code registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};

use super::types::RelayError;

/// Sink the reassembler appends chunk payloads to
pub type ArtifactWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An artifact opened for reading, with its size at open time
pub struct OpenArtifact {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub size: u64,
}

impl std::fmt::Debug for OpenArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenArtifact").field("size", &self.size).finish()
    }
}

/// Trait for artifact storage backends
#[async_trait::async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Create an empty artifact, truncating any existing one
    async fn create(&self, key: &str) -> Result<ArtifactWriter, RelayError>;

    /// Open an artifact. `Ok(None)` means it does not exist.
    async fn open(&self, key: &str) -> Result<Option<OpenArtifact>, RelayError>;

    /// Delete an artifact. Returns `false` if it was already gone.
    async fn remove(&self, key: &str) -> Result<bool, RelayError>;

    /// Every stored artifact with the time it was last written
    async fn scan(&self) -> Result<Vec<(String, DateTime<Utc>)>, RelayError>;
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem artifact storage under `base_path/files`
pub struct LocalArtifactStorage {
    file_dir: PathBuf,
}

impl LocalArtifactStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            file_dir: base_path.join("files"),
        }
    }

    fn artifact_path(&self, key: &str) -> PathBuf {
        self.file_dir.join(key)
    }
}

#[async_trait::async_trait]
impl ArtifactStorage for LocalArtifactStorage {
    async fn create(&self, key: &str) -> Result<ArtifactWriter, RelayError> {
        tokio::fs::create_dir_all(&self.file_dir)
            .await
            .map_err(|e| RelayError::io("create artifact dir", self.file_dir.display().to_string(), e))?;

        let file = tokio::fs::File::create(self.artifact_path(key))
            .await
            .map_err(|e| RelayError::io("create artifact", key, e))?;
        Ok(Box::new(file))
    }

    async fn open(&self, key: &str) -> Result<Option<OpenArtifact>, RelayError> {
        let file = match tokio::fs::File::open(self.artifact_path(key)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RelayError::io("open artifact", key, e)),
        };

        // Size comes from the open handle so it matches the bytes streamed
        let size = file
            .metadata()
            .await
            .map_err(|e| RelayError::io("stat artifact", key, e))?
            .len();

        Ok(Some(OpenArtifact {
            reader: Box::new(file),
            size,
        }))
    }

    async fn remove(&self, key: &str) -> Result<bool, RelayError> {
        match tokio::fs::remove_file(self.artifact_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RelayError::io("delete artifact", key, e)),
        }
    }

    async fn scan(&self) -> Result<Vec<(String, DateTime<Utc>)>, RelayError> {
        let dir = self.file_dir.display().to_string();
        let mut entries = match tokio::fs::read_dir(&self.file_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RelayError::io("scan artifacts", dir, e)),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| RelayError::io("scan artifacts", dir.clone(), e))?
        {
            let Ok(key) = entry.file_name().into_string() else {
                continue;
            };
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

type Slot = Arc<Mutex<Vec<u8>>>;

/// In-memory artifact storage
#[derive(Default)]
pub struct MemoryArtifactStorage {
    artifacts: RwLock<HashMap<String, (Slot, DateTime<Utc>)>>,
}

impl MemoryArtifactStorage {
    pub fn contains(&self, key: &str) -> bool {
        self.artifacts.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the artifact bytes
    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.artifacts
            .read()
            .get(key)
            .map(|(slot, _)| slot.lock().clone())
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &str, created_at: DateTime<Utc>) {
        if let Some(entry) = self.artifacts.write().get_mut(key) {
            entry.1 = created_at;
        }
    }
}

struct MemoryWriter {
    slot: Slot,
}

impl AsyncWrite for MemoryWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.slot.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl ArtifactStorage for MemoryArtifactStorage {
    async fn create(&self, key: &str) -> Result<ArtifactWriter, RelayError> {
        let slot: Slot = Arc::default();
        self.artifacts
            .write()
            .insert(key.to_string(), (slot.clone(), Utc::now()));
        Ok(Box::new(MemoryWriter { slot }))
    }

    async fn open(&self, key: &str) -> Result<Option<OpenArtifact>, RelayError> {
        Ok(self.bytes(key).map(|data| OpenArtifact {
            size: data.len() as u64,
            reader: Box::new(std::io::Cursor::new(data)),
        }))
    }

    async fn remove(&self, key: &str) -> Result<bool, RelayError> {
        Ok(self.artifacts.write().remove(key).is_some())
    }

    async fn scan(&self) -> Result<Vec<(String, DateTime<Utc>)>, RelayError> {
        Ok(self
            .artifacts
            .read()
            .iter()
            .map(|(key, (_, created_at))| (key.clone(), *created_at))
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn exercise(storage: &dyn ArtifactStorage) {
        let mut writer = storage.create("k_a.txt").await.unwrap();
        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        writer.shutdown().await.unwrap();

        let mut opened = storage.open("k_a.txt").await.unwrap().unwrap();
        assert_eq!(opened.size, 11);
        let mut out = Vec::new();
        opened.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");

        // create truncates
        let mut writer = storage.create("k_a.txt").await.unwrap();
        writer.write_all(b"x").await.unwrap();
        writer.shutdown().await.unwrap();
        assert_eq!(storage.open("k_a.txt").await.unwrap().unwrap().size, 1);

        let scanned = storage.scan().await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, "k_a.txt");

        assert!(storage.remove("k_a.txt").await.unwrap());
        assert!(!storage.remove("k_a.txt").await.unwrap());
        assert!(storage.open("k_a.txt").await.unwrap().is_none());
        assert!(storage.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_artifact_storage() {
        let temp_dir = TempDir::new().unwrap();
        exercise(&LocalArtifactStorage::new(temp_dir.path().to_path_buf())).await;
    }

    #[tokio::test]
    async fn test_memory_artifact_storage() {
        exercise(&MemoryArtifactStorage::default()).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_handle_survives_removal() {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalArtifactStorage::new(temp_dir.path().to_path_buf());

        let mut writer = storage.create("k_b.bin").await.unwrap();
        writer.write_all(&[7u8; 4096]).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut opened = storage.open("k_b.bin").await.unwrap().unwrap();
        assert!(storage.remove("k_b.bin").await.unwrap());

        let mut out = Vec::new();
        opened.reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len() as u64, opened.size);
    }
}
