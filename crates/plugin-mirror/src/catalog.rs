use std::collections::BTreeMap;
use std::fmt;

use crate::feedback::Feedback;

/// A product build identifier (e.g. `IC-203.7717`) that scopes one catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProductVersion(String);

impl ProductVersion {
    pub fn new(build: impl Into<String>) -> Self {
        Self(build.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one storable artifact, independent of any product version.
/// The same plugin/version referenced by several catalogs is stored once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactKey {
    pub plugin_id: String,
    pub version: String,
}

impl ArtifactKey {
    pub fn new(plugin_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.plugin_id, self.version)
    }
}

/// One plugin's published metadata for a product version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub key: ArtifactKey,
    pub name: String,
    pub description: Option<String>,
    pub download_url: String,
    /// Lowercase SHA-256 hex, when upstream publishes one.
    pub checksum: Option<String>,
    pub size: Option<u64>,
    /// Attributes of the `<idea-version>` element, passed through to the
    /// local catalog unchanged.
    pub idea_version: BTreeMap<String, String>,
}

impl CatalogEntry {
    pub fn plugin_id(&self) -> &str {
        &self.key.plugin_id
    }

    pub fn version(&self) -> &str {
        &self.key.version
    }
}

/// A decoded upstream catalog.
///
/// Entries the client had to reject are not included; each rejection is
/// reported as a warning in `feedback`.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub version: ProductVersion,
    pub entries: Vec<CatalogEntry>,
    pub feedback: Vec<Feedback>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_key_display() {
        let key = ArtifactKey::new("org.foo", "1.0.2");
        assert_eq!(key.to_string(), "org.foo@1.0.2");
    }

    #[test]
    fn product_version_round_trips_str() {
        let version = ProductVersion::new("IC-203.7717");
        assert_eq!(version.as_str(), "IC-203.7717");
        assert_eq!(version.to_string(), "IC-203.7717");
    }

    #[test]
    fn keys_differ_by_version() {
        assert_ne!(ArtifactKey::new("foo", "1.0"), ArtifactKey::new("foo", "1.1"));
    }
}
