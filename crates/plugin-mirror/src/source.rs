use std::sync::Arc;

use crate::catalog::{Catalog, ProductVersion};

/// Errors that can occur while fetching an upstream catalog.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Network failure, timeout, or a non-success status.
    #[error("catalog unreachable: {0}")]
    Unreachable(String),

    /// The response could not be decoded into a plugin catalog.
    #[error("catalog malformed: {0}")]
    Malformed(String),
}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Where upstream catalogs come from.
///
/// A source does not retry; the orchestrator applies its own policy.
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    /// Human-readable label for logs.
    fn label(&self) -> &str;

    async fn fetch_catalog(&self, version: &ProductVersion) -> Result<Catalog, CatalogError>;
}

#[async_trait::async_trait]
impl<T: CatalogSource + ?Sized> CatalogSource for Arc<T> {
    fn label(&self) -> &str {
        (**self).label()
    }

    async fn fetch_catalog(&self, version: &ProductVersion) -> Result<Catalog, CatalogError> {
        (**self).fetch_catalog(version).await
    }
}
