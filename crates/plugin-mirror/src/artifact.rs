use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::TempPath;

use crate::catalog::{ArtifactKey, CatalogEntry};

/// A completed download recorded in the mirror store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub key: ArtifactKey,
    /// Lowercase SHA-256 hex of the stored file.
    pub checksum: String,
    /// Path relative to the storage root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    /// Epoch seconds at which the artifact was committed.
    pub completed_at: u64,
}

impl StoredArtifact {
    /// Whether this file satisfies an upstream checksum. No checksum means
    /// any stored copy will do.
    pub fn matches_checksum(&self, checksum: Option<&str>) -> bool {
        checksum.is_none_or(|c| self.checksum.eq_ignore_ascii_case(c))
    }
}

/// What the fetcher needs to download one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub key: ArtifactKey,
    pub url: String,
    pub expected_checksum: Option<String>,
    pub expected_size: Option<u64>,
}

impl FetchRequest {
    pub fn for_entry(entry: &CatalogEntry) -> Self {
        Self {
            key: entry.key.clone(),
            url: entry.download_url.clone(),
            expected_checksum: entry.checksum.clone(),
            expected_size: entry.size,
        }
    }
}

/// A verified download waiting in the store's staging area.
///
/// The staged file is deleted when this value is dropped, unless the store
/// has moved it into place.
#[derive(Debug)]
pub struct FetchedArtifact {
    pub key: ArtifactKey,
    pub staged: TempPath,
    pub file_name: String,
    pub checksum: String,
    pub size: u64,
}

impl FetchedArtifact {
    pub fn staged_path(&self) -> &Path {
        &self.staged
    }
}

/// Why a single artifact attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Network trouble, server errors, or a timed out attempt.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Upstream rejected the request (4xx); retrying will not help.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Writing to local storage failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::IntegrityMismatch { .. })
    }

    /// Short machine-friendly name used in logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::IntegrityMismatch { .. } => "integrity-mismatch",
            Self::Storage(_) => "storage",
        }
    }
}

/// Result of dispatching one artifact to the worker pool.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fetched {
        artifact: StoredArtifact,
        attempts: u32,
    },
    Failed {
        key: ArtifactKey,
        error: FetchError,
        attempts: u32,
        /// True when the failure was retryable but the attempt budget ran out.
        exhausted: bool,
    },
}

impl FetchOutcome {
    pub fn key(&self) -> &ArtifactKey {
        match self {
            Self::Fetched { artifact, .. } => &artifact.key,
            Self::Failed { key, .. } => key,
        }
    }
}

/// Downloads single artifacts into a staging directory.
///
/// Implementations must be safe to call concurrently; each call only touches
/// its own temporary file.
#[async_trait::async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest,
        staging: &Path,
    ) -> Result<FetchedArtifact, FetchError>;
}

/// Incremental SHA-256 over streamed content.
#[derive(Default)]
pub struct ContentHasher {
    hasher: Sha256,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `(checksum hex, byte count)`.
    pub fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.len)
    }
}

/// SHA-256 hex of an in-memory buffer.
pub fn checksum_of(bytes: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.finish().0
}

/// Compare a computed digest and size against a request's expectations.
pub fn verify(
    request: &FetchRequest,
    checksum: &str,
    size: u64,
) -> Result<(), FetchError> {
    if let Some(expected) = &request.expected_checksum
        && !expected.eq_ignore_ascii_case(checksum)
    {
        return Err(FetchError::IntegrityMismatch {
            expected: expected.clone(),
            actual: checksum.to_owned(),
        });
    }

    if let Some(expected) = request.expected_size
        && expected != size
    {
        return Err(FetchError::IntegrityMismatch {
            expected: format!("{expected} bytes"),
            actual: format!("{size} bytes"),
        });
    }

    Ok(())
}

/// Resolve a stored artifact's absolute path under a storage root.
pub fn absolute_path(storage_root: &Path, artifact: &StoredArtifact) -> PathBuf {
    artifact
        .relative_path
        .split('/')
        .fold(storage_root.to_path_buf(), |path, part| path.join(part))
}
