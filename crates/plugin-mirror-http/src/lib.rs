pub mod catalog_client;
pub mod disposition;
pub mod download;
pub mod xml;

pub use catalog_client::CatalogClient;
pub use download::HttpArtifactFetcher;

/// User agent sent with every upstream request.
pub const USER_AGENT: &str = concat!("plugin-mirror/", env!("CARGO_PKG_VERSION"));
