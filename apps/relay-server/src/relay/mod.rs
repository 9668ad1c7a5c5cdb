//! Temporary File Relay
//!
//! Chunked uploads are reassembled into an artifact that is reachable through
//! a short retrieval code for one hour.
//!
//! Flow:
//! 1. Client uploads chunks `(file name, index)` in any order
//! 2. Client asks for a merge; chunks are folded in index order and a code is
//!    registered
//! 3. Anyone holding the code downloads the artifact until it expires
//! 4. The sweeper deletes expired artifacts and codes, plus leftovers of
//!    abandoned uploads and merges
//!
//! Storage layout under the relay root:
//! - `chunks/<file name>_chunk-<index>`
//! - `files/<uuid>_<file name>`
//! - `code_map.json`

pub mod artifact_store;
pub mod chunk_store;
pub mod codes;
pub mod locks;
pub mod reassembler;
pub mod registry;
pub mod retrieval;
pub mod sweeper;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

pub use artifact_store::{ArtifactStorage, LocalArtifactStorage, MemoryArtifactStorage};
pub use chunk_store::{ChunkStorage, ChunkStore};
pub use reassembler::Reassembler;
pub use registry::CodeRegistry;
pub use retrieval::{content_disposition, RetrievalService, Retrieved};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use types::*;

/// Registry file name inside the relay root
pub const REGISTRY_FILE: &str = "code_map.json";

/// The relay components wired to one set of stores
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    chunks: ChunkStore,
    registry: CodeRegistry,
    reassembler: Reassembler,
    retrieval: RetrievalService,
    sweeper: ExpirySweeper,
}

impl Relay {
    /// Relay backed by the local filesystem under `root`
    pub fn open_local(root: PathBuf) -> Self {
        let chunks = ChunkStore::with_local_storage(root.clone());
        let artifacts: Arc<dyn ArtifactStorage> = Arc::new(LocalArtifactStorage::new(root.clone()));
        let registry = CodeRegistry::open(root.join(REGISTRY_FILE));
        Self::from_parts(chunks, artifacts, registry)
    }

    /// Relay held entirely in memory
    pub fn in_memory() -> Self {
        Self::from_parts(
            ChunkStore::in_memory(),
            Arc::new(MemoryArtifactStorage::default()),
            CodeRegistry::in_memory(),
        )
    }

    pub fn from_parts(
        chunks: ChunkStore,
        artifacts: Arc<dyn ArtifactStorage>,
        registry: CodeRegistry,
    ) -> Self {
        let reassembler = Reassembler::new(chunks.clone(), artifacts.clone(), registry.clone());
        let retrieval = RetrievalService::new(registry.clone(), artifacts.clone());
        let sweeper = ExpirySweeper::new(registry.clone(), artifacts, chunks.clone())
            .with_merge_locks(reassembler.merge_locks());

        Self {
            inner: Arc::new(RelayInner {
                chunks,
                registry,
                reassembler,
                retrieval,
                sweeper,
            }),
        }
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.inner.chunks
    }

    pub fn registry(&self) -> &CodeRegistry {
        &self.inner.registry
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.inner.reassembler
    }

    pub fn retrieval(&self) -> &RetrievalService {
        &self.inner.retrieval
    }

    pub fn sweeper(&self) -> &ExpirySweeper {
        &self.inner.sweeper
    }

    /// Run the sweeper on a fixed interval
    pub fn start_sweep_task(self, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                self.sweeper().sweep().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_relay_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let relay = Relay::open_local(temp_dir.path().to_path_buf());

        relay.chunks().put("hello.txt", 1, b"world").await.unwrap();
        relay.chunks().put("hello.txt", 0, b"hello ").await.unwrap();

        let outcome = relay.reassembler().merge("hello.txt").await.unwrap();
        assert_eq!(outcome.code.len(), CODE_LENGTH);
        assert!(temp_dir.path().join(REGISTRY_FILE).exists());

        let mut retrieved = relay.retrieval().retrieve(&outcome.code).await.unwrap();
        let mut bytes = Vec::new();
        while let Some(block) = retrieved.stream.next().await {
            bytes.extend_from_slice(&block.unwrap());
        }
        assert_eq!(bytes, b"hello world");

        // Nothing expired yet
        assert_eq!(relay.sweeper().sweep().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_task_runs_periodically() {
        let relay = Relay::in_memory();
        let mut entry = CodeEntry::new("old.bin", "k_old.bin");
        entry.created_at = chrono::Utc::now() - chrono::Duration::hours(2);
        relay.registry().insert_entry("old00000", entry).await.unwrap();

        let handle = relay.clone().start_sweep_task(std::time::Duration::from_secs(60));
        // The first tick fires immediately
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        handle.abort();

        assert!(relay.registry().list_all().await.unwrap().is_empty());
    }
}
