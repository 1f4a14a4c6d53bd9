use std::sync::Arc;

use anyhow::Result;
use plugin_mirror::{Feedback, Orchestrator, RunReport, SyncOptions};
use plugin_mirror_http::{CatalogClient, HttpArtifactFetcher};
use plugin_mirror_store::FsMirrorStore;
use tokio_util::sync::CancellationToken;

use super::format;
use crate::config::AppConfig;

/// Print feedback items to stderr.
pub fn print_feedback(scope: &str, feedback: &[Feedback]) {
    for item in feedback {
        eprintln!("[{scope}] {item}");
    }
}

/// Run a full mirror sync and print the report. Returns the report so the
/// caller can pick the exit status.
pub async fn run(
    config: &AppConfig,
    store: Arc<FsMirrorStore>,
    options: SyncOptions,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let versions = config.product_versions();
    println!(
        "Syncing {} product versions from {}...",
        versions.len(),
        config.base_url
    );

    let catalogs = Arc::new(CatalogClient::new(&config.base_url, &config.upstream_url));
    let fetcher = Arc::new(HttpArtifactFetcher::new());
    let orchestrator = Orchestrator::new(store, catalogs, fetcher, options);

    let report = orchestrator.run(&versions, cancel).await;

    for version in &report.versions {
        print_feedback(version.version.as_str(), &version.feedback);
        for failed in &version.failed {
            eprintln!(
                "[{}] omitted {} after {} attempt(s): {}",
                version.version, failed.key, failed.attempts, failed.error
            );
        }
    }
    print_feedback("run", &report.feedback);

    for line in format::version_lines(&report) {
        println!("{line}");
    }
    println!(
        "{}",
        format::retirement_line(report.retirement.as_ref(), report.cancelled)
    );
    println!(
        "Published {} of {} versions ({} artifacts fetched).",
        report.published_count(),
        report.versions.len(),
        report.total_fetched()
    );

    Ok(report)
}
