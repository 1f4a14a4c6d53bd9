use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::artifact::{FetchedArtifact, StoredArtifact};
use crate::catalog::{ArtifactKey, CatalogEntry, ProductVersion};

/// Errors raised by mirror store operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("migration error: {0}")]
    Migration(String),

    /// A catalog entry points at an artifact that is not on disk.
    #[error("catalog references missing artifact {0}")]
    DanglingReference(ArtifactKey),

    #[error("failed to move {path} into place: {reason}")]
    Persist { path: PathBuf, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Read-only view of which artifacts are already mirrored.
pub trait ArtifactLookup {
    /// The stored record for `key`, if its file is present and intact.
    fn lookup(&self, key: &ArtifactKey) -> Result<Option<StoredArtifact>, StoreError>;

    fn has_artifact(&self, key: &ArtifactKey, checksum: Option<&str>) -> Result<bool, StoreError> {
        Ok(self
            .lookup(key)?
            .is_some_and(|stored| stored.matches_checksum(checksum)))
    }
}

impl ArtifactLookup for HashMap<ArtifactKey, StoredArtifact> {
    fn lookup(&self, key: &ArtifactKey) -> Result<Option<StoredArtifact>, StoreError> {
        Ok(self.get(key).cloned())
    }
}

/// One published catalog line: upstream metadata plus the local artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCatalogEntry {
    pub entry: CatalogEntry,
    pub artifact: StoredArtifact,
}

/// The document published for one product version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCatalog {
    pub version: ProductVersion,
    pub entries: Vec<LocalCatalogEntry>,
}

impl LocalCatalog {
    pub fn keys(&self) -> HashSet<ArtifactKey> {
        self.entries.iter().map(|e| e.artifact.key.clone()).collect()
    }
}

/// Where a catalog ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedCatalog {
    pub version: ProductVersion,
    pub path: PathBuf,
    pub entries: usize,
}

/// Summary of a retirement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetireReport {
    /// Indexed artifacts removed because no published catalog references them.
    pub retired: Vec<ArtifactKey>,
    /// Unindexed files and directories swept from the content area.
    pub swept: usize,
    /// Catalogs withdrawn because their product version is no longer configured.
    pub withdrawn: Vec<ProductVersion>,
}

/// The on-disk mirror: artifact content, its index, and published catalogs.
///
/// All operations are short local filesystem work and never suspend. Each
/// mutating call is atomic: it either fully applies or leaves the previous
/// state in place.
pub trait MirrorStore: ArtifactLookup + Send + Sync {
    /// Directory where fetchers stage downloads. Lives on the same
    /// filesystem as the content area so commits are plain renames.
    fn staging_dir(&self) -> &Path;

    /// Move a verified download into the content area and record it.
    fn commit_artifact(&self, fetched: FetchedArtifact) -> Result<StoredArtifact, StoreError>;

    /// Replace the published catalog for `catalog.version`.
    fn publish_catalog(&self, catalog: &LocalCatalog) -> Result<PublishedCatalog, StoreError>;

    fn published_versions(&self) -> Result<Vec<ProductVersion>, StoreError>;

    fn published_keys(&self, version: &ProductVersion) -> Result<HashSet<ArtifactKey>, StoreError>;

    /// Remove a published catalog and its index rows.
    fn withdraw_catalog(&self, version: &ProductVersion) -> Result<(), StoreError>;

    /// Delete every stored artifact whose key is not in `retained`.
    fn retire_unreferenced(
        &self,
        retained: &HashSet<ArtifactKey>,
    ) -> Result<RetireReport, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str, version: &str, checksum: &str) -> StoredArtifact {
        StoredArtifact {
            key: ArtifactKey::new(id, version),
            checksum: checksum.into(),
            relative_path: format!("{id}/{version}/{id}.zip"),
            size: 1,
            completed_at: 0,
        }
    }

    #[test]
    fn has_artifact_compares_checksum_when_given() {
        let mut index = HashMap::new();
        let record = stored("foo", "1.0", "abc");
        index.insert(record.key.clone(), record);

        let key = ArtifactKey::new("foo", "1.0");
        assert!(index.has_artifact(&key, Some("ABC")).unwrap());
        assert!(!index.has_artifact(&key, Some("def")).unwrap());
        assert!(index.has_artifact(&key, None).unwrap());
        assert!(
            !index
                .has_artifact(&ArtifactKey::new("foo", "2.0"), None)
                .unwrap()
        );
    }
}
