//! Expiry Sweeper
//!
//! Deletes artifacts and registry entries older than the retention window,
//! plus leftovers no registry entry leads to: chunk sets whose upload went
//! quiet and artifacts from merges that never registered. Failures are per
//! entry: one bad entry is logged and kept for the next sweep, the rest are
//! still cleaned.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::artifact_store::ArtifactStorage;
use super::chunk_store::ChunkStore;
use super::locks::KeyedLocks;
use super::registry::CodeRegistry;
use super::types::{retention_window, CodeEntry, RelayError};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Registry entries removed by this sweep
    pub removed: usize,
    /// Expired entries left in place because cleanup failed
    pub failed: usize,
    /// Chunks of abandoned uploads deleted
    pub orphaned_chunks: usize,
    /// Unregistered artifacts deleted
    pub orphaned_artifacts: usize,
}

pub struct ExpirySweeper {
    registry: CodeRegistry,
    artifacts: Arc<dyn ArtifactStorage>,
    chunks: ChunkStore,
    merge_locks: Arc<KeyedLocks>,
}

impl ExpirySweeper {
    pub fn new(
        registry: CodeRegistry,
        artifacts: Arc<dyn ArtifactStorage>,
        chunks: ChunkStore,
    ) -> Self {
        Self {
            registry,
            artifacts,
            chunks,
            merge_locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Share the reassembler's merge locks so chunks being merged are never
    /// purged
    pub fn with_merge_locks(mut self, merge_locks: Arc<KeyedLocks>) -> Self {
        self.merge_locks = merge_locks;
        self
    }

    /// Sweep now, returning the number of entries removed
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await.removed
    }

    /// Sweep as of `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = now - retention_window();

        let entries = match self.registry.list_all().await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Sweep could not read the registry");
                Vec::new()
            }
        };

        for (code, entry) in entries {
            if !entry.is_expired_at(now) {
                continue;
            }

            match self.expire(&code, &entry).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(code = %code, error = %e, "Failed to clean expired entry");
                    report.failed += 1;
                }
            }
        }

        match self.purge_abandoned_chunks(cutoff).await {
            Ok(count) => report.orphaned_chunks = count,
            Err(e) => tracing::error!(error = %e, "Failed to purge orphaned chunks"),
        }

        match self.purge_unregistered_artifacts(cutoff).await {
            Ok(count) => report.orphaned_artifacts = count,
            Err(e) => tracing::error!(error = %e, "Failed to purge orphaned artifacts"),
        }

        if report != SweepReport::default() {
            tracing::info!(
                removed = report.removed,
                failed = report.failed,
                orphaned_chunks = report.orphaned_chunks,
                orphaned_artifacts = report.orphaned_artifacts,
                "Sweep finished"
            );
        }

        report
    }

    /// Delete the artifact, then the entry. Returns `false` when another
    /// sweep already took the entry.
    async fn expire(&self, code: &str, entry: &CodeEntry) -> Result<bool, RelayError> {
        if !self.artifacts.remove(&entry.artifact_key).await? {
            tracing::warn!(
                code = %code,
                artifact_key = %entry.artifact_key,
                "Expired artifact was already gone"
            );
        }

        let removed = self.registry.remove_matching(code, entry).await?;
        if removed {
            tracing::debug!(code = %code, file_name = %entry.file_name, "Expired entry removed");
        }
        Ok(removed)
    }

    /// Delete chunk sets whose newest chunk is older than `cutoff`, skipping
    /// any set a merge is working on
    async fn purge_abandoned_chunks(&self, cutoff: DateTime<Utc>) -> Result<usize, RelayError> {
        let mut count = 0;

        for (owner, keys) in self.chunks.stale_owners(cutoff).await? {
            let Some(_guard) = self.merge_locks.try_lock(&owner) else {
                tracing::debug!(file_name = %owner, "Merge in progress, chunks kept");
                continue;
            };

            for key in keys {
                match self.chunks.remove(&key).await {
                    Ok(()) => count += 1,
                    Err(e) => {
                        tracing::warn!(chunk = %key.encode(), error = %e, "Failed to remove stale chunk");
                    }
                }
            }
            tracing::debug!(file_name = %owner, "Abandoned upload purged");
        }

        Ok(count)
    }

    /// Delete artifacts older than `cutoff` that no registry entry points at
    async fn purge_unregistered_artifacts(&self, cutoff: DateTime<Utc>) -> Result<usize, RelayError> {
        let referenced: HashSet<String> = self
            .registry
            .list_all()
            .await?
            .into_iter()
            .map(|(_, entry)| entry.artifact_key)
            .collect();

        let mut count = 0;
        for (key, written_at) in self.artifacts.scan().await? {
            if written_at >= cutoff || referenced.contains(&key) {
                continue;
            }

            match self.artifacts.remove(&key).await {
                Ok(true) => {
                    tracing::debug!(artifact_key = %key, "Unregistered artifact removed");
                    count += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(artifact_key = %key, error = %e, "Failed to remove unregistered artifact");
                }
            }
        }

        Ok(count)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::artifact_store::{ArtifactWriter, MemoryArtifactStorage, OpenArtifact};
    use crate::relay::chunk_store::{ChunkReader, ChunkStorage, MemoryChunkStorage};
    use crate::relay::reassembler::Reassembler;
    use crate::relay::types::ChunkKey;
    use chrono::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::Notify;

    struct Fixture {
        registry: CodeRegistry,
        artifacts: Arc<MemoryArtifactStorage>,
        chunks: ChunkStore,
        sweeper: ExpirySweeper,
    }

    fn fixture() -> Fixture {
        let registry = CodeRegistry::in_memory();
        let artifacts = Arc::new(MemoryArtifactStorage::default());
        let chunks = ChunkStore::in_memory();
        let sweeper = ExpirySweeper::new(registry.clone(), artifacts.clone(), chunks.clone());
        Fixture {
            registry,
            artifacts,
            chunks,
            sweeper,
        }
    }

    async fn add(f: &Fixture, code: &str, age: Duration) {
        let key = format!("k_{code}");
        f.artifacts.create(&key).await.unwrap();
        let mut entry = CodeEntry::new(format!("{code}.bin"), key);
        entry.created_at = Utc::now() - age;
        f.registry.insert_entry(code, entry).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let f = fixture();
        add(&f, "old00001", Duration::hours(2)).await;
        add(&f, "old00002", Duration::hours(3)).await;
        add(&f, "new00001", Duration::minutes(5)).await;

        assert_eq!(f.sweeper.sweep().await, 2);
        assert_eq!(f.sweeper.sweep().await, 0);

        let left = f.registry.list_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, "new00001");
        assert!(f.artifacts.contains("k_new00001"));
        assert!(!f.artifacts.contains("k_old00001"));
    }

    #[tokio::test]
    async fn test_sweep_boundary() {
        let f = fixture();
        let now = Utc::now();
        add(&f, "young000", Duration::seconds(3599)).await;
        add(&f, "stale000", Duration::seconds(3601)).await;

        let report = f.sweeper.sweep_at(now).await;
        assert_eq!(report.removed, 1);
        assert!(f.registry.resolve("young000").await.is_ok());
        assert!(f.registry.resolve("stale000").await.is_err());
    }

    #[tokio::test]
    async fn test_missing_artifact_still_clears_entry() {
        let f = fixture();
        add(&f, "gone0000", Duration::hours(2)).await;
        f.artifacts.remove("k_gone0000").await.unwrap();

        assert_eq!(f.sweeper.sweep().await, 1);
        assert!(f.registry.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_chunks_are_purged() {
        let f = fixture();
        f.chunks.put("fresh.bin", 0, b"x").await.unwrap();

        // Two hours from now the chunk is past the window
        let report = f.sweeper.sweep_at(Utc::now() + Duration::hours(2)).await;
        assert_eq!(report.orphaned_chunks, 1);
        assert_eq!(report.removed, 0);
        assert!(f.chunks.list_sorted("fresh.bin").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_upload_keeps_early_chunks() {
        let backend = Arc::new(MemoryChunkStorage::default());
        let chunks = ChunkStore::with_backend(backend.clone());
        let artifacts = Arc::new(MemoryArtifactStorage::default());
        let registry = CodeRegistry::in_memory();
        let reassembler = Reassembler::new(chunks.clone(), artifacts.clone(), registry.clone());
        let sweeper = ExpirySweeper::new(registry.clone(), artifacts.clone(), chunks.clone())
            .with_merge_locks(reassembler.merge_locks());

        chunks.put("slow.bin", 0, b"HEAD-").await.unwrap();
        backend.backdate(&ChunkKey::new("slow.bin", 0), Utc::now() - Duration::minutes(90));
        chunks.put("slow.bin", 1, b"TAIL").await.unwrap();

        let report = sweeper.sweep_at(Utc::now()).await;
        assert_eq!(report.orphaned_chunks, 0);

        let outcome = reassembler.merge("slow.bin").await.unwrap();
        let entry = registry.resolve(&outcome.code).await.unwrap();
        assert_eq!(artifacts.bytes(&entry.artifact_key).unwrap(), b"HEAD-TAIL");
    }

    #[tokio::test]
    async fn test_idle_upload_purged_then_merge_refused() {
        let f = fixture();
        f.chunks.put("idle.bin", 0, b"HEAD-").await.unwrap();

        let report = f.sweeper.sweep_at(Utc::now() + Duration::minutes(61)).await;
        assert_eq!(report.orphaned_chunks, 1);

        // The client resumes after the purge; the merge must not produce "TAIL"
        f.chunks.put("idle.bin", 1, b"TAIL").await.unwrap();
        let reassembler = Reassembler::new(f.chunks.clone(), f.artifacts.clone(), f.registry.clone());
        let result = reassembler.merge("idle.bin").await;
        assert!(matches!(result, Err(RelayError::MissingChunk { index: 0, .. })));
        assert!(f.artifacts.is_empty());
        assert!(f.registry.list_all().await.unwrap().is_empty());
    }

    /// Chunk backend whose reads of one index wait for a signal
    struct GatedChunks {
        inner: Arc<MemoryChunkStorage>,
        gate: Arc<Notify>,
        gated_index: u64,
    }

    #[async_trait::async_trait]
    impl ChunkStorage for GatedChunks {
        async fn put(&self, key: &ChunkKey, data: &[u8]) -> Result<(), RelayError> {
            self.inner.put(key, data).await
        }

        async fn list(&self, owner: &str) -> Result<Vec<ChunkKey>, RelayError> {
            self.inner.list(owner).await
        }

        async fn open(&self, key: &ChunkKey) -> Result<ChunkReader, RelayError> {
            if key.index == self.gated_index {
                self.gate.notified().await;
            }
            self.inner.open(key).await
        }

        async fn remove(&self, key: &ChunkKey) -> Result<(), RelayError> {
            self.inner.remove(key).await
        }

        async fn scan(&self) -> Result<Vec<(ChunkKey, DateTime<Utc>)>, RelayError> {
            self.inner.scan().await
        }
    }

    struct MergeRig {
        memory: Arc<MemoryChunkStorage>,
        gate: Arc<Notify>,
        chunks: ChunkStore,
        artifacts: Arc<MemoryArtifactStorage>,
        registry: CodeRegistry,
        reassembler: Arc<Reassembler>,
        sweeper: ExpirySweeper,
    }

    /// Three stale chunks of `gated.bin`; merges stop before opening chunk 1
    async fn merge_rig() -> MergeRig {
        let memory = Arc::new(MemoryChunkStorage::default());
        let gate = Arc::new(Notify::new());
        let chunks = ChunkStore::with_backend(Arc::new(GatedChunks {
            inner: memory.clone(),
            gate: gate.clone(),
            gated_index: 1,
        }));
        let artifacts = Arc::new(MemoryArtifactStorage::default());
        let registry = CodeRegistry::in_memory();
        let reassembler = Arc::new(Reassembler::new(
            chunks.clone(),
            artifacts.clone(),
            registry.clone(),
        ));
        let sweeper = ExpirySweeper::new(registry.clone(), artifacts.clone(), chunks.clone())
            .with_merge_locks(reassembler.merge_locks());

        for (index, data) in [b"aa", b"bb", b"cc"].into_iter().enumerate() {
            chunks.put("gated.bin", index as u64, data).await.unwrap();
            memory.backdate(
                &ChunkKey::new("gated.bin", index as u64),
                Utc::now() - Duration::hours(2),
            );
        }

        MergeRig {
            memory,
            gate,
            chunks,
            artifacts,
            registry,
            reassembler,
            sweeper,
        }
    }

    /// Wait until the merge has consumed chunk 0 and is parked on chunk 1
    async fn wait_for_merge_at_gate(rig: &MergeRig) {
        while rig.memory.len() == 3 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(!rig.reassembler.merge_locks().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_skips_chunks_under_merge() {
        let rig = merge_rig().await;

        let merge = tokio::spawn({
            let reassembler = rig.reassembler.clone();
            async move { reassembler.merge("gated.bin").await }
        });
        wait_for_merge_at_gate(&rig).await;

        let report = rig.sweeper.sweep_at(Utc::now()).await;
        assert_eq!(report.orphaned_chunks, 0);
        assert_eq!(rig.memory.len(), 2);

        rig.gate.notify_one();
        let outcome = merge.await.unwrap().unwrap();
        let entry = rig.registry.resolve(&outcome.code).await.unwrap();
        assert_eq!(rig.artifacts.bytes(&entry.artifact_key).unwrap(), b"aabbcc");
    }

    #[tokio::test]
    async fn test_merge_fails_cleanly_when_listed_chunk_vanishes() {
        let rig = merge_rig().await;

        let merge = tokio::spawn({
            let reassembler = rig.reassembler.clone();
            async move { reassembler.merge("gated.bin").await }
        });
        wait_for_merge_at_gate(&rig).await;

        // Deleted behind the merge lock's back
        rig.chunks
            .remove(&ChunkKey::new("gated.bin", 1))
            .await
            .unwrap();
        rig.gate.notify_one();

        let result = merge.await.unwrap();
        assert!(matches!(result, Err(RelayError::Io { op: "open chunk", .. })));
        assert!(rig.registry.list_all().await.unwrap().is_empty());
        assert!(rig.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_artifacts_are_purged() {
        let f = fixture();

        let mut writer = f.artifacts.create("k_orphan").await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        f.artifacts.backdate("k_orphan", Utc::now() - Duration::hours(2));

        // Old bytes, but still referenced by a live entry
        f.artifacts.create("k_live").await.unwrap();
        f.artifacts.backdate("k_live", Utc::now() - Duration::hours(2));
        f.registry
            .insert_entry("live0000", CodeEntry::new("live.bin", "k_live"))
            .await
            .unwrap();

        // Unregistered but young: a merge may still be writing it
        f.artifacts.create("k_young").await.unwrap();

        let report = f.sweeper.sweep_at(Utc::now()).await;
        assert_eq!(report.orphaned_artifacts, 1);
        assert!(!f.artifacts.contains("k_orphan"));
        assert!(f.artifacts.contains("k_live"));
        assert!(f.artifacts.contains("k_young"));

        assert_eq!(f.sweeper.sweep_at(Utc::now()).await.orphaned_artifacts, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sweeps_do_not_double_count() {
        let f = Arc::new(fixture());
        for i in 0..20 {
            add(&f, &format!("old{i:05}"), Duration::hours(2)).await;
        }

        let a = tokio::spawn({
            let f = f.clone();
            async move { f.sweeper.sweep().await }
        });
        let b = tokio::spawn({
            let f = f.clone();
            async move { f.sweeper.sweep().await }
        });

        assert_eq!(a.await.unwrap() + b.await.unwrap(), 20);
        assert!(f.registry.list_all().await.unwrap().is_empty());
    }

    /// Artifact storage that refuses to delete one key
    struct StickyArtifacts {
        inner: MemoryArtifactStorage,
        sticky: String,
    }

    #[async_trait::async_trait]
    impl ArtifactStorage for StickyArtifacts {
        async fn create(&self, key: &str) -> Result<ArtifactWriter, RelayError> {
            self.inner.create(key).await
        }

        async fn open(&self, key: &str) -> Result<Option<OpenArtifact>, RelayError> {
            self.inner.open(key).await
        }

        async fn scan(&self) -> Result<Vec<(String, DateTime<Utc>)>, RelayError> {
            self.inner.scan().await
        }

        async fn remove(&self, key: &str) -> Result<bool, RelayError> {
            if key == self.sticky {
                return Err(RelayError::io(
                    "delete artifact",
                    key,
                    std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                ));
            }
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_failed_deletion_does_not_abort_sweep() {
        let registry = CodeRegistry::in_memory();
        let artifacts = Arc::new(StickyArtifacts {
            inner: MemoryArtifactStorage::default(),
            sticky: "k_stuck000".to_string(),
        });
        let sweeper = ExpirySweeper::new(registry.clone(), artifacts.clone(), ChunkStore::in_memory());

        for code in ["aaa00000", "stuck000", "zzz00000"] {
            let key = format!("k_{code}");
            artifacts.create(&key).await.unwrap();
            let mut entry = CodeEntry::new("f.bin", key);
            entry.created_at = Utc::now() - Duration::hours(2);
            registry.insert_entry(code, entry).await.unwrap();
        }

        let report = sweeper.sweep_at(Utc::now()).await;
        assert_eq!(report.removed, 2);
        assert_eq!(report.failed, 1);

        // The stuck entry stays so the next sweep can retry it
        let left = registry.list_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, "stuck000");
    }
}
