use std::fmt;
use std::path::PathBuf;

use crate::artifact::FetchError;
use crate::catalog::{ArtifactKey, ProductVersion};
use crate::feedback::Feedback;
use crate::mirror::RetireReport;

/// Lifecycle of one product version within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VersionState {
    #[default]
    Pending,
    CatalogFetched,
    Planned,
    Fetching,
    Published,
    Failed,
    Cancelled,
}

impl VersionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Published | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_advance_to(self, next: VersionState) -> bool {
        use VersionState::*;
        match (self, next) {
            (Pending, CatalogFetched) => true,
            (CatalogFetched, Planned) => true,
            (Planned, Fetching) => true,
            (Fetching, Published) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for VersionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::CatalogFetched => "catalog-fetched",
            Self::Planned => "planned",
            Self::Fetching => "fetching",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// How a product version ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionStatus {
    Published { path: PathBuf },
    Failed { reason: String },
    Cancelled,
}

/// An entry left out of the published catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEntry {
    pub key: ArtifactKey,
    pub error: FetchError,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct VersionReport {
    pub version: ProductVersion,
    pub status: VersionStatus,
    pub fetched: usize,
    pub kept: usize,
    pub failed: Vec<FailedEntry>,
    pub feedback: Vec<Feedback>,
}

impl VersionReport {
    pub fn new(version: ProductVersion, status: VersionStatus) -> Self {
        Self {
            version,
            status,
            fetched: 0,
            kept: 0,
            failed: Vec::new(),
            feedback: Vec::new(),
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self.status, VersionStatus::Published { .. })
    }
}

/// Everything an operator needs to know about one sync run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub versions: Vec<VersionReport>,
    /// `None` when retirement was disabled, skipped or failed.
    pub retirement: Option<RetireReport>,
    pub cancelled: bool,
    pub feedback: Vec<Feedback>,
}

impl RunReport {
    pub fn published_count(&self) -> usize {
        self.versions.iter().filter(|v| v.is_published()).count()
    }

    /// A run fails only when nothing at all was published.
    pub fn is_success(&self) -> bool {
        self.versions.is_empty() || self.published_count() > 0
    }

    pub fn total_fetched(&self) -> usize {
        self.versions.iter().map(|v| v.fetched).sum()
    }

    pub fn version(&self, version: &ProductVersion) -> Option<&VersionReport> {
        self.versions.iter().find(|v| &v.version == version)
    }
}
