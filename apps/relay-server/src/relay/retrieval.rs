//! Retrieval Service
//!
//! Resolves a code to its artifact and hands back a byte stream. Retrieval is
//! read-only: an expired code is reported, never deleted here.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

use super::artifact_store::{ArtifactStorage, OpenArtifact};
use super::registry::CodeRegistry;
use super::types::RelayError;

/// A resolved download
pub struct Retrieved {
    pub file_name: String,
    pub size: u64,
    pub stream: ArtifactStream,
}

impl Retrieved {
    /// `Content-Disposition` value carrying the UTF-8 file name
    pub fn content_disposition(&self) -> String {
        content_disposition(&self.file_name)
    }
}

pub struct RetrievalService {
    registry: CodeRegistry,
    artifacts: Arc<dyn ArtifactStorage>,
}

impl RetrievalService {
    pub fn new(registry: CodeRegistry, artifacts: Arc<dyn ArtifactStorage>) -> Self {
        Self {
            registry,
            artifacts,
        }
    }

    pub async fn retrieve(&self, code: &str) -> Result<Retrieved, RelayError> {
        self.retrieve_at(code, Utc::now()).await
    }

    /// Resolve `code` as of `now`
    pub async fn retrieve_at(&self, code: &str, now: DateTime<Utc>) -> Result<Retrieved, RelayError> {
        let entry = self.registry.resolve(code).await?;

        if entry.is_expired_at(now) {
            return Err(RelayError::Expired(code.to_string()));
        }

        // Opened before returning so a concurrent sweep cannot pull the file
        // out from under the stream
        let Some(OpenArtifact { reader, size }) = self.artifacts.open(&entry.artifact_key).await?
        else {
            tracing::error!(
                code = %code,
                artifact_key = %entry.artifact_key,
                "Registry entry points at a missing artifact"
            );
            return Err(RelayError::ArtifactMissing {
                code: code.to_string(),
                artifact_key: entry.artifact_key,
            });
        };

        tracing::info!(code = %code, file_name = %entry.file_name, size = size, "Serving download");

        Ok(Retrieved {
            file_name: entry.file_name,
            size,
            stream: ArtifactStream::new(reader, size),
        })
    }
}

/// `attachment; filename*=UTF-8''<percent-encoded name>`
pub fn content_disposition(file_name: &str) -> String {
    format!(
        "attachment; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

// ============================================================================
// Artifact Stream
// ============================================================================

type ArtifactReader = Box<dyn AsyncRead + Send + Unpin>;

/// Single-pass stream of artifact blocks.
///
/// Ends with an error if the bytes read differ from the size announced at open
/// time, so a short read never looks like a complete file.
pub struct ArtifactStream {
    inner: ReaderStream<ArtifactReader>,
    expected: u64,
    seen: u64,
    finished: bool,
}

impl ArtifactStream {
    pub fn new(reader: ArtifactReader, expected: u64) -> Self {
        Self {
            inner: ReaderStream::new(reader),
            expected,
            seen: 0,
            finished: false,
        }
    }

    fn fail(&mut self, kind: std::io::ErrorKind, message: String) -> Poll<Option<std::io::Result<Bytes>>> {
        self.finished = true;
        Poll::Ready(Some(Err(std::io::Error::new(kind, message))))
    }
}

impl Stream for ArtifactStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            Some(Ok(block)) => {
                this.seen += block.len() as u64;
                if this.seen > this.expected {
                    let message = format!("artifact grew past {} bytes while streaming", this.expected);
                    return this.fail(std::io::ErrorKind::InvalidData, message);
                }
                Poll::Ready(Some(Ok(block)))
            }
            Some(Err(e)) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None if this.seen < this.expected => {
                let message = format!(
                    "artifact ended after {} of {} bytes",
                    this.seen, this.expected
                );
                this.fail(std::io::ErrorKind::UnexpectedEof, message)
            }
            None => {
                this.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
