//! Where things live on disk.
//!
//! Artifact directories are derived from digests so arbitrary plugin ids and
//! version strings map to short, filesystem-safe, collision-resistant names.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use plugin_mirror::{ArtifactKey, ProductVersion};
use sha2::{Digest, Sha256};

/// Directory holding the index database and the staging area.
pub const STATE_DIR: &str = ".mirror";
pub const STAGING_DIR: &str = "staging";
pub const INDEX_FILE: &str = "index.db";

/// URL-safe, unpadded base64 of the first 16 bytes of the SHA-256 of `value`.
pub fn escape_component(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

/// `<escaped id>/<escaped version>`, relative to the storage root.
pub fn artifact_dir(key: &ArtifactKey) -> String {
    format!(
        "{}/{}",
        escape_component(&key.plugin_id),
        escape_component(&key.version)
    )
}

/// Turn a `/`-separated relative path into a path under `root`.
pub fn resolve(root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .fold(root.to_path_buf(), |path, part| path.join(part))
}

/// Catalog document name for a product build.
///
/// Builds shaped like `IC-203.7717` share one file per product and branch
/// (`plugins-IC-203.xml`); anything else keeps its full, sanitized build id.
pub fn catalog_file_name(version: &ProductVersion) -> String {
    match product_branch(version.as_str()) {
        Some((product, branch)) => format!("plugins-{product}-{branch}.xml"),
        None => {
            let sanitized: String = version
                .as_str()
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect();
            format!("plugins-{sanitized}.xml")
        }
    }
}

/// Split `IC-203.7717...` into `("IC", "203")`.
fn product_branch(build: &str) -> Option<(&str, &str)> {
    let (product, rest) = build.split_once('-')?;
    if product.is_empty() || !product.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }
    let (branch, _) = rest.split_once('.')?;
    if branch.is_empty() || !branch.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((product, branch))
}

/// Public URL of a stored file. `storage_url` must end with `/`.
pub fn artifact_url(storage_url: &str, relative_path: &str) -> String {
    format!("{storage_url}{relative_path}")
}
