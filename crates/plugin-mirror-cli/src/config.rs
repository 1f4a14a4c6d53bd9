use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use plugin_mirror::{ProductVersion, RetryPolicy, SyncOptions};
use serde::{Deserialize, Serialize};

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Where catalog documents are written.
    pub base_path: PathBuf,
    /// Where artifact files are stored.
    pub storage_path: PathBuf,
    /// Upstream catalog endpoint.
    pub base_url: String,
    /// Public URL `storage_path` is served under.
    pub storage_url: String,
    /// Upstream host download URLs are derived from.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub sync: SyncSection,
}

/// Optional `[sync]` table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncSection {
    pub workers: usize,
    pub queue_capacity: usize,
    pub attempt_timeout_secs: u64,
    pub catalog_timeout_secs: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_secs: u64,
    pub retire: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 64,
            attempt_timeout_secs: 300,
            catalog_timeout_secs: 60,
            max_attempts: 4,
            base_delay_ms: 1000,
            max_delay_secs: 60,
            retire: true,
        }
    }
}

fn default_upstream_url() -> String {
    "https://plugins.jetbrains.com".into()
}

impl AppConfig {
    pub fn product_versions(&self) -> Vec<ProductVersion> {
        self.versions
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(ProductVersion::new)
            .collect()
    }

    /// Orchestrator options, narrowed to `include` when non-empty.
    pub fn sync_options(&self, include: &[String]) -> SyncOptions {
        let s = &self.sync;
        let retry = RetryPolicy {
            max_attempts: s.max_attempts.max(1),
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_secs(s.max_delay_secs),
            ..RetryPolicy::default()
        };
        SyncOptions {
            workers: s.workers.max(1),
            queue_capacity: s.queue_capacity.max(1),
            attempt_timeout: Duration::from_secs(s.attempt_timeout_secs),
            catalog_timeout: Duration::from_secs(s.catalog_timeout_secs),
            catalog_retry: retry.clone(),
            artifact_retry: retry,
            include: (!include.is_empty())
                .then(|| include.iter().cloned().collect::<HashSet<_>>()),
            retire: s.retire,
        }
    }
}

/// Config file path: `~/.config/plugin-mirror/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("plugin-mirror").join("config.toml"))
}

/// Load config from `path`, or from the default location. A missing file is
/// an error.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path().context("could not determine config directory")?,
    };
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config at {}", path.display()))
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(contents)?;
    if config.versions.iter().all(|v| v.trim().is_empty()) {
        anyhow::bail!("no product versions configured");
    }
    Ok(config)
}
