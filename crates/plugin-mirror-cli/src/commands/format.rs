use plugin_mirror::{RetireReport, RunReport, VersionReport, VersionStatus};
use plugin_mirror_store::CatalogRecord;

const MAX_VERSION_WIDTH: usize = 24;

/// One line per version: `IC-203.1  published  3 fetched, 10 kept, 1 failed`.
pub fn version_lines(report: &RunReport) -> Vec<String> {
    let width = report
        .versions
        .iter()
        .map(|v| v.version.as_str().chars().count())
        .max()
        .unwrap_or(0)
        .min(MAX_VERSION_WIDTH);

    report
        .versions
        .iter()
        .map(|v| {
            format!(
                "  {:<width$}  {:<9}  {}",
                truncate(v.version.as_str(), width),
                status_label(&v.status),
                counts(v),
                width = width
            )
        })
        .collect()
}

fn status_label(status: &VersionStatus) -> &'static str {
    match status {
        VersionStatus::Published { .. } => "published",
        VersionStatus::Failed { .. } => "failed",
        VersionStatus::Cancelled => "cancelled",
    }
}

fn counts(version: &VersionReport) -> String {
    match &version.status {
        VersionStatus::Failed { reason } => reason.clone(),
        _ => format!(
            "{} fetched, {} kept, {} failed",
            version.fetched,
            version.kept,
            version.failed.len()
        ),
    }
}

pub fn retirement_line(retirement: Option<&RetireReport>, cancelled: bool) -> String {
    match retirement {
        Some(r) => format!(
            "Retired {} artifacts, swept {} stray files, withdrew {} catalogs.",
            r.retired.len(),
            r.swept,
            r.withdrawn.len()
        ),
        None if cancelled => "Retirement skipped (run cancelled).".into(),
        None => "Retirement skipped.".into(),
    }
}

pub fn catalog_line(record: &CatalogRecord, now: u64) -> String {
    format!(
        "  {:<width$}  {:<28}  {:>5} plugins  {}",
        truncate(record.version.as_str(), MAX_VERSION_WIDTH),
        record.file_name,
        record.entries,
        age(now.saturating_sub(record.published_at)),
        width = MAX_VERSION_WIDTH
    )
}

fn age(secs: u64) -> String {
    match secs {
        0..60 => "just now".into(),
        60..3600 => format!("{}m ago", secs / 60),
        3600..86400 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86400),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_owned()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}
