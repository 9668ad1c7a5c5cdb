//! Code Registry
//!
//! Persistent mapping from retrieval code to artifact. The registry is kept
//! as a single JSON document (`code_map.json`) and every access goes through
//! one async mutex, so a load-mutate-persist cycle never interleaves with
//! another writer and no update is lost.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::types::{CodeEntry, RelayError};

type CodeMap = BTreeMap<String, CodeEntry>;

/// Backing store of the registry
enum Backing {
    /// JSON file reloaded on every cycle
    File(PathBuf),
    /// Process-local map
    Memory(CodeMap),
}

/// Shared handle to the code registry
#[derive(Clone)]
pub struct CodeRegistry {
    inner: Arc<Mutex<Backing>>,
}

impl CodeRegistry {
    /// Registry persisted at `path`. The file is created on first write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Backing::File(path.into()))),
        }
    }

    /// Registry that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Backing::Memory(CodeMap::new()))),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Register `code`, overwriting any existing entry. `createdAt` is now.
    pub async fn register(
        &self,
        code: &str,
        file_name: &str,
        artifact_key: &str,
    ) -> Result<CodeEntry, RelayError> {
        let entry = CodeEntry::new(file_name, artifact_key);
        self.insert_entry(code, entry.clone()).await?;
        Ok(entry)
    }

    /// Insert or overwrite a complete entry
    pub async fn insert_entry(&self, code: &str, entry: CodeEntry) -> Result<(), RelayError> {
        self.update(|map| {
            map.insert(code.to_string(), entry);
            ((), true)
        })
        .await
    }

    /// Insert an entry only if `code` is not registered yet
    pub async fn try_insert_entry(&self, code: &str, entry: CodeEntry) -> Result<(), RelayError> {
        self.update(|map| {
            if map.contains_key(code) {
                (Err(RelayError::CodeTaken(code.to_string())), false)
            } else {
                map.insert(code.to_string(), entry);
                (Ok(()), true)
            }
        })
        .await?
    }

    /// Look up a code. No expiry check is made here.
    pub async fn resolve(&self, code: &str) -> Result<CodeEntry, RelayError> {
        self.read(|map| map.get(code).cloned())
            .await?
            .ok_or_else(|| RelayError::NotFound(code.to_string()))
    }

    /// Remove a code. Returns whether an entry was actually removed.
    pub async fn remove(&self, code: &str) -> Result<bool, RelayError> {
        self.update(|map| {
            let removed = map.remove(code).is_some();
            (removed, removed)
        })
        .await
    }

    /// Remove a code only while it still maps to `expected`
    pub async fn remove_matching(
        &self,
        code: &str,
        expected: &CodeEntry,
    ) -> Result<bool, RelayError> {
        self.update(|map| {
            if map.get(code) == Some(expected) {
                map.remove(code);
                (true, true)
            } else {
                (false, false)
            }
        })
        .await
    }

    /// Snapshot of every entry
    pub async fn list_all(&self) -> Result<Vec<(String, CodeEntry)>, RelayError> {
        self.read(|map| {
            map.iter()
                .map(|(code, entry)| (code.clone(), entry.clone()))
                .collect()
        })
        .await
    }

    // ========================================================================
    // Load / Persist
    // ========================================================================

    async fn read<R>(&self, f: impl FnOnce(&CodeMap) -> R + Send) -> Result<R, RelayError> {
        let backing = self.inner.lock().await;
        match &*backing {
            Backing::Memory(map) => Ok(f(map)),
            Backing::File(path) => {
                let map = load(path).await?;
                Ok(f(&map))
            }
        }
    }

    /// Run one mutation under the lock. The closure reports whether it
    /// changed the map; unchanged maps are not written back.
    async fn update<R: Send>(
        &self,
        f: impl FnOnce(&mut CodeMap) -> (R, bool) + Send,
    ) -> Result<R, RelayError> {
        let mut backing = self.inner.lock().await;
        match &mut *backing {
            Backing::Memory(map) => Ok(f(map).0),
            Backing::File(path) => {
                let mut map = load(path).await?;
                let (result, dirty) = f(&mut map);
                if dirty {
                    persist(path, &map).await?;
                }
                Ok(result)
            }
        }
    }
}

/// Load the registry file. A missing file is an empty registry, and so is an
/// unparsable one, which is logged.
async fn load(path: &Path) -> Result<CodeMap, RelayError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CodeMap::new()),
        Err(e) => return Err(RelayError::io("load registry", path.display().to_string(), e)),
    };

    match serde_json::from_slice(&data) {
        Ok(map) => Ok(map),
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Registry file is unreadable, starting empty");
            Ok(CodeMap::new())
        }
    }
}

/// Write the registry to a sibling temp file and rename it into place
async fn persist(path: &Path, map: &CodeMap) -> Result<(), RelayError> {
    let key = path.display().to_string();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RelayError::io("create registry dir", key.clone(), e))?;
    }

    let data = serde_json::to_vec_pretty(map)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| RelayError::io("write registry", key.clone(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| RelayError::io("replace registry", key, e))
}

// ============================================================================
// Tests
// ============================================================================
