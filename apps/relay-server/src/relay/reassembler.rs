//! Reassembler
//!
//! Folds the chunks of one file into a single artifact in index order and
//! registers a retrieval code for it.
//!
//! Merges of the same file name are serialized through a keyed lock, so a
//! second merge racing the first finds the chunks already consumed and fails
//! with `NoChunksFound` instead of interleaving writes.
//!
//! There is no rollback: if an I/O error interrupts a merge, chunks folded so
//! far are already deleted. The partial artifact is discarded because its key
//! was never registered, including when the merge future is dropped midway.
//! A chunk set with a hole in its indices is refused before anything is
//! consumed.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::artifact_store::ArtifactStorage;
use super::chunk_store::ChunkStore;
use super::codes::mint_code;
use super::locks::KeyedLocks;
use super::registry::CodeRegistry;
use super::types::{validate_file_name, ChunkKey, CodeEntry, MergeOutcome, RelayError};

/// How many codes are minted before giving up on registration
const MAX_MINT_ATTEMPTS: usize = 8;

pub struct Reassembler {
    chunks: ChunkStore,
    artifacts: Arc<dyn ArtifactStorage>,
    registry: CodeRegistry,
    merge_locks: Arc<KeyedLocks>,
    mint: fn() -> String,
}

impl Reassembler {
    pub fn new(
        chunks: ChunkStore,
        artifacts: Arc<dyn ArtifactStorage>,
        registry: CodeRegistry,
    ) -> Self {
        Self {
            chunks,
            artifacts,
            registry,
            merge_locks: Arc::new(KeyedLocks::new()),
            mint: mint_code,
        }
    }

    /// Lock arena guarding merges, keyed by file name
    pub fn merge_locks(&self) -> Arc<KeyedLocks> {
        self.merge_locks.clone()
    }

    /// Replace the code minter
    pub fn with_code_minter(mut self, mint: fn() -> String) -> Self {
        self.mint = mint;
        self
    }

    /// Merge every uploaded chunk of `file_name` and register a code for it
    pub async fn merge(&self, file_name: &str) -> Result<MergeOutcome, RelayError> {
        validate_file_name(file_name)?;

        let _guard = self.merge_locks.lock(file_name).await;

        let keys = self.chunks.list_sorted(file_name).await?;
        if keys.is_empty() {
            return Err(RelayError::NoChunksFound(file_name.to_string()));
        }
        if let Some(index) = first_missing_index(&keys) {
            tracing::warn!(file_name = %file_name, index = index, "Chunk set has a gap");
            return Err(RelayError::MissingChunk {
                file_name: file_name.to_string(),
                index,
            });
        }

        tracing::info!(
            file_name = %file_name,
            chunks = keys.len(),
            "Assembling file from chunks"
        );

        let artifact_key = format!("{}_{}", Uuid::new_v4().simple(), file_name);
        let pending = PendingArtifact::new(self.artifacts.clone(), artifact_key.clone());

        let size = match self.fold_chunks(&artifact_key, &keys).await {
            Ok(size) => size,
            Err(e) => {
                tracing::error!(file_name = %file_name, error = %e, "Merge failed");
                pending.discard().await;
                return Err(e);
            }
        };

        if size == 0 {
            pending.discard().await;
            return Err(RelayError::EmptyResult(file_name.to_string()));
        }

        let code = match self.register(file_name, &artifact_key).await {
            Ok(code) => code,
            Err(e) => {
                pending.discard().await;
                return Err(e);
            }
        };
        pending.keep();

        tracing::info!(
            code = %code,
            file_name = %file_name,
            size = size,
            "File merged and registered"
        );

        Ok(MergeOutcome {
            code,
            file_name: file_name.to_string(),
            size,
            chunks: keys.len(),
        })
    }

    /// Append each chunk in order, deleting it once it is on disk
    async fn fold_chunks(&self, artifact_key: &str, keys: &[ChunkKey]) -> Result<u64, RelayError> {
        let mut writer = self.artifacts.create(artifact_key).await?;
        let mut total = 0u64;

        for key in keys {
            let mut reader = self.chunks.open(key).await?;
            total += tokio::io::copy(&mut reader, &mut writer)
                .await
                .map_err(|e| RelayError::io("append chunk", key.encode(), e))?;
            writer
                .flush()
                .await
                .map_err(|e| RelayError::io("flush artifact", artifact_key, e))?;

            self.chunks.remove(key).await?;
        }

        writer
            .shutdown()
            .await
            .map_err(|e| RelayError::io("close artifact", artifact_key, e))?;

        Ok(total)
    }

    async fn register(&self, file_name: &str, artifact_key: &str) -> Result<String, RelayError> {
        for _ in 0..MAX_MINT_ATTEMPTS {
            let code = (self.mint)();
            let entry = CodeEntry::new(file_name, artifact_key);

            match self.registry.try_insert_entry(&code, entry).await {
                Ok(()) => return Ok(code),
                Err(RelayError::CodeTaken(_)) => {
                    tracing::debug!(code = %code, "Code already taken, minting another");
                }
                Err(e) => return Err(e),
            }
        }

        Err(RelayError::CodeSpaceExhausted(MAX_MINT_ATTEMPTS))
    }
}

/// First index missing from a sorted chunk list that should run `0..n`
fn first_missing_index(keys: &[ChunkKey]) -> Option<u64> {
    keys.iter()
        .enumerate()
        .find(|(expected, key)| key.index != *expected as u64)
        .map(|(expected, _)| expected as u64)
}

/// Artifact written by a merge that has not been registered yet.
///
/// Dropped while still armed (the merge future was cancelled), it removes the
/// artifact from a spawned task since no registry entry will ever lead the
/// sweeper to it.
struct PendingArtifact {
    artifacts: Arc<dyn ArtifactStorage>,
    key: String,
    armed: bool,
}

impl PendingArtifact {
    fn new(artifacts: Arc<dyn ArtifactStorage>, key: String) -> Self {
        Self {
            artifacts,
            key,
            armed: true,
        }
    }

    /// Registered: the artifact now belongs to the registry
    fn keep(mut self) {
        self.armed = false;
    }

    async fn discard(mut self) {
        self.armed = false;
        remove_artifact(self.artifacts.as_ref(), &self.key).await;
    }
}

impl Drop for PendingArtifact {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let artifacts = self.artifacts.clone();
        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(artifact_key = %key, "Merge cancelled, discarding artifact");
                handle.spawn(async move {
                    remove_artifact(artifacts.as_ref(), &key).await;
                });
            }
            Err(_) => {
                tracing::warn!(artifact_key = %key, "Merge cancelled outside a runtime, artifact left for the sweeper");
            }
        }
    }
}

async fn remove_artifact(artifacts: &dyn ArtifactStorage, key: &str) {
    if let Err(e) = artifacts.remove(key).await {
        tracing::warn!(artifact_key = %key, error = %e, "Failed to discard artifact");
    }
}

// ============================================================================
// Tests
// ============================================================================
