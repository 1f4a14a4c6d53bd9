use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use plugin_mirror_store::FsMirrorStore;

use super::format;
use crate::config::AppConfig;

/// Show what the mirror currently publishes.
pub fn run(config: &AppConfig, store: &FsMirrorStore) -> Result<()> {
    let catalogs = store.published_catalogs()?;
    let artifacts = store.stored_artifacts()?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    println!("Catalogs in {}", store.base_path().display());
    if catalogs.is_empty() {
        println!("  (none published yet)");
    }
    for record in &catalogs {
        println!("{}", format::catalog_line(record, now));
    }

    let configured = config.product_versions();
    for version in &configured {
        if !catalogs.iter().any(|c| &c.version == version) {
            eprintln!("warning: {version} is configured but has never been published");
        }
    }
    for record in &catalogs {
        if !configured.contains(&record.version) {
            eprintln!(
                "warning: {} is no longer configured and will be withdrawn on the next sync",
                record.version
            );
        }
    }

    let bytes: u64 = artifacts.iter().map(|a| a.size).sum();
    println!(
        "\n{} artifacts ({:.1} MiB) in {}",
        artifacts.len(),
        bytes as f64 / (1024.0 * 1024.0),
        store.storage_path().display()
    );
    Ok(())
}
