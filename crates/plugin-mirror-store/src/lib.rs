pub mod catalog_xml;
pub mod layout;
pub mod schema;
pub mod store;

pub use store::{CatalogRecord, FsMirrorStore};
