//! Diffing an upstream catalog against what the mirror already holds.

use std::collections::HashSet;

use crate::artifact::StoredArtifact;
use crate::catalog::{ArtifactKey, CatalogEntry};
use crate::mirror::{ArtifactLookup, StoreError};

/// Why an entry has to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchReason {
    Missing,
    ChecksumChanged { stored: String },
    SizeChanged { stored: u64 },
}

/// Classification of one catalog's entries.
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub to_fetch: Vec<(CatalogEntry, FetchReason)>,
    pub to_keep: Vec<(CatalogEntry, StoredArtifact)>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_fetch.is_empty() && self.to_keep.is_empty()
    }
}

/// Decide, per entry, whether the stored artifact can be kept.
///
/// Checksum wins over size when upstream publishes both; size is only
/// consulted when no checksum is available. Entries repeating a key already
/// seen in `entries` are dropped.
pub fn plan<L: ArtifactLookup + ?Sized>(
    entries: &[CatalogEntry],
    lookup: &L,
) -> Result<SyncPlan, StoreError> {
    let mut seen = HashSet::new();
    let mut plan = SyncPlan::default();

    for entry in entries {
        if !seen.insert(entry.key.clone()) {
            continue;
        }

        match classify(entry, lookup.lookup(&entry.key)?) {
            Ok(stored) => plan.to_keep.push((entry.clone(), stored)),
            Err(reason) => plan.to_fetch.push((entry.clone(), reason)),
        }
    }

    Ok(plan)
}

fn classify(
    entry: &CatalogEntry,
    stored: Option<StoredArtifact>,
) -> Result<StoredArtifact, FetchReason> {
    let stored = stored.ok_or(FetchReason::Missing)?;

    if entry.checksum.is_some() {
        if !stored.matches_checksum(entry.checksum.as_deref()) {
            return Err(FetchReason::ChecksumChanged {
                stored: stored.checksum,
            });
        }
        return Ok(stored);
    }

    match entry.size {
        Some(size) if size != stored.size => Err(FetchReason::SizeChanged {
            stored: stored.size,
        }),
        _ => Ok(stored),
    }
}

/// Keep only entries whose plugin id is in `include`, when a filter is set.
pub fn filter_included(
    entries: Vec<CatalogEntry>,
    include: Option<&HashSet<String>>,
) -> Vec<CatalogEntry> {
    match include {
        Some(ids) if !ids.is_empty() => entries
            .into_iter()
            .filter(|e| ids.contains(e.plugin_id()))
            .collect(),
        _ => entries,
    }
}

/// Stored keys that no retained catalog references, in sorted order.
pub fn retirement_candidates<'a>(
    stored: impl IntoIterator<Item = &'a ArtifactKey>,
    retained: &HashSet<ArtifactKey>,
) -> Vec<ArtifactKey> {
    let mut to_retire: Vec<ArtifactKey> = stored
        .into_iter()
        .filter(|key| !retained.contains(*key))
        .cloned()
        .collect();
    to_retire.sort();
    to_retire.dedup();
    to_retire
}
