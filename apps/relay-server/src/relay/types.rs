//! Relay types shared by the chunk store, registry, reassembler and sweeper

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Retention window for codes and artifacts: 1 hour
pub const RETENTION_WINDOW_SECS: i64 = 60 * 60;

/// Length of a retrieval code
pub const CODE_LENGTH: usize = 8;

/// Maximum file name length in bytes
pub const MAX_FILE_NAME_BYTES: usize = 200;

/// Separator between owner file name and chunk index in a chunk key
pub const CHUNK_KEY_SEPARATOR: &str = "_chunk-";

/// Retention window as a chrono duration
pub fn retention_window() -> Duration {
    Duration::seconds(RETENTION_WINDOW_SECS)
}

/// Whether something created at `created_at` is past the retention window at `now`
pub fn is_expired(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now - created_at > retention_window()
}

// ============================================================================
// Chunk Types
// ============================================================================

/// Storage key of a single chunk: `<owner>_chunk-<index>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub owner: String,
    pub index: u64,
}

impl ChunkKey {
    pub fn new(owner: impl Into<String>, index: u64) -> Self {
        Self {
            owner: owner.into(),
            index,
        }
    }

    /// Encoded key used as the stored object name
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.owner, CHUNK_KEY_SEPARATOR, self.index)
    }

    /// Parse a stored object name back into a key owned by `owner`.
    ///
    /// Returns `None` for names of other owners and for non-numeric suffixes,
    /// so `a_chunk-1_chunk-0` is never mistaken for a chunk of `a`.
    pub fn parse_for_owner(owner: &str, encoded: &str) -> Option<Self> {
        let suffix = encoded
            .strip_prefix(owner)?
            .strip_prefix(CHUNK_KEY_SEPARATOR)?;

        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        suffix.parse().ok().map(|index| Self::new(owner, index))
    }

    /// Parse any stored object name, splitting at the last separator
    pub fn parse(encoded: &str) -> Option<Self> {
        let at = encoded.rfind(CHUNK_KEY_SEPARATOR)?;
        let owner = &encoded[..at];
        if owner.is_empty() {
            return None;
        }
        Self::parse_for_owner(owner, encoded)
    }
}

/// Acknowledgement for a stored chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub file_name: String,
    pub chunk_index: u64,
    pub size: u64,
}

// ============================================================================
// Registry Types
// ============================================================================

/// One entry of the code registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeEntry {
    /// Original file name, used for the download header
    pub file_name: String,

    /// Storage key of the merged artifact
    pub artifact_key: String,

    /// Registration time, stored as epoch milliseconds
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl CodeEntry {
    pub fn new(file_name: impl Into<String>, artifact_key: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            artifact_key: artifact_key.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.created_at, now)
    }
}

/// Result of a successful merge
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub code: String,
    pub file_name: String,
    pub size: u64,
    pub chunks: usize,
}

// ============================================================================
// Validation
// ============================================================================

/// Validate a client supplied file name before it becomes part of a storage key
pub fn validate_file_name(name: &str) -> Result<(), RelayError> {
    let reason = if name.is_empty() {
        Some("file name is empty")
    } else if name.len() > MAX_FILE_NAME_BYTES {
        Some("file name is too long")
    } else if name == "." || name == ".." {
        Some("file name is reserved")
    } else if name.contains(['/', '\\', '\0']) {
        Some("file name contains a path separator")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(RelayError::InvalidFileName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Relay error types
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Chunk is empty")]
    EmptyPayload,

    #[error("Invalid file name {name:?}: {reason}")]
    InvalidFileName { name: String, reason: &'static str },

    #[error("No chunks found for {0}")]
    NoChunksFound(String),

    #[error("Merged file {0} is empty")]
    EmptyResult(String),

    #[error("Chunk {index} of {file_name} is missing")]
    MissingChunk { file_name: String, index: u64 },

    #[error("Code not found: {0}")]
    NotFound(String),

    #[error("Code expired: {0}")]
    Expired(String),

    #[error("Code already registered: {0}")]
    CodeTaken(String),

    #[error("Artifact {artifact_key} for code {code} is missing")]
    ArtifactMissing { code: String, artifact_key: String },

    #[error("Could not mint a unique code after {0} attempts")]
    CodeSpaceExhausted(usize),

    #[error("I/O failure during {op} on {key}: {source}")]
    Io {
        op: &'static str,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Registry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl RelayError {
    /// Wrap an I/O error with the operation and key it happened on
    pub fn io(op: &'static str, key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            key: key.into(),
            source,
        }
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::EmptyPayload => StatusCode::BAD_REQUEST,
            Self::InvalidFileName { .. } => StatusCode::BAD_REQUEST,
            Self::NoChunksFound(_) => StatusCode::BAD_REQUEST,
            Self::EmptyResult(_) => StatusCode::BAD_REQUEST,
            Self::MissingChunk { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Expired(_) => StatusCode::GONE,
            Self::CodeTaken(_) => StatusCode::CONFLICT,
            Self::ArtifactMissing { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CodeSpaceExhausted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the message can be shown to the caller verbatim
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

// ============================================================================
// Tests
// ============================================================================
