pub mod artifact;
pub mod catalog;
pub mod feedback;
pub mod mirror;
pub mod plan;
pub mod report;
pub mod retry;
pub mod source;
pub mod sync;

pub use artifact::{
    ArtifactFetcher, ContentHasher, FetchError, FetchOutcome, FetchRequest, FetchedArtifact,
    StoredArtifact, checksum_of,
};
pub use catalog::{ArtifactKey, Catalog, CatalogEntry, ProductVersion};
pub use feedback::Feedback;
pub use mirror::{
    ArtifactLookup, LocalCatalog, LocalCatalogEntry, MirrorStore, PublishedCatalog, RetireReport,
    StoreError,
};
pub use plan::{FetchReason, SyncPlan};
pub use report::{FailedEntry, RunReport, VersionReport, VersionState, VersionStatus};
pub use retry::RetryPolicy;
pub use source::{CatalogError, CatalogSource};
pub use sync::{Orchestrator, SyncOptions};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
