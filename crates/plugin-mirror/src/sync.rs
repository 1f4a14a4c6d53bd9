//! Drives a full mirror run across every configured product version.
//!
//! Catalog fetches run concurrently. Each catalog is planned as soon as it
//! arrives and its downloads are queued for a fixed pool of workers. A single
//! aggregator loop owns all run state: it routes worker results back to the
//! versions waiting on them and publishes a version as soon as every one of
//! its downloads has an outcome. Retirement runs last, once every version has
//! reached a terminal state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::artifact::{ArtifactFetcher, FetchError, FetchOutcome, FetchRequest, StoredArtifact};
use crate::catalog::{ArtifactKey, Catalog, CatalogEntry, ProductVersion};
use crate::feedback::Feedback;
use crate::mirror::{LocalCatalog, LocalCatalogEntry, MirrorStore, RetireReport, StoreError};
use crate::plan::{self, FetchReason};
use crate::report::{FailedEntry, RunReport, VersionReport, VersionState, VersionStatus};
use crate::retry::RetryPolicy;
use crate::source::{CatalogError, CatalogSource};

/// Tuning knobs for one run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Number of parallel fetch workers.
    pub workers: usize,
    /// Pending downloads buffered ahead of the workers.
    pub queue_capacity: usize,
    pub attempt_timeout: Duration,
    pub catalog_timeout: Duration,
    pub catalog_retry: RetryPolicy,
    pub artifact_retry: RetryPolicy,
    /// Only mirror these plugin ids, when set.
    pub include: Option<HashSet<String>>,
    /// Withdraw unconfigured catalogs and delete unreferenced artifacts.
    pub retire: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 64,
            attempt_timeout: Duration::from_secs(300),
            catalog_timeout: Duration::from_secs(60),
            catalog_retry: RetryPolicy::default(),
            artifact_retry: RetryPolicy::default(),
            include: None,
            retire: true,
        }
    }
}

/// Runs the catalog → plan → fetch → publish → retire pipeline.
pub struct Orchestrator {
    store: Arc<dyn MirrorStore>,
    catalogs: Arc<dyn CatalogSource>,
    fetcher: Arc<dyn ArtifactFetcher>,
    options: SyncOptions,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn MirrorStore>,
        catalogs: Arc<dyn CatalogSource>,
        fetcher: Arc<dyn ArtifactFetcher>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            catalogs,
            fetcher,
            options,
        }
    }

    /// Sync every version in `versions`.
    ///
    /// Cancelling `cancel` stops dispatching, aborts downloads in flight, and
    /// leaves every version that had not published yet with its previous
    /// catalog. Commits and publishes already underway always complete.
    pub async fn run(&self, versions: &[ProductVersion], cancel: CancellationToken) -> RunReport {
        let mut run = RunState::new(versions);
        info!(
            source = self.catalogs.label(),
            versions = run.order.len(),
            workers = self.options.workers,
            "starting mirror run"
        );

        let (job_tx, job_rx) = mpsc::channel::<FetchRequest>(self.options.queue_capacity.max(1));
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<FetchOutcome>();

        let worker_cancel = cancel.child_token();
        let mut workers = JoinSet::new();
        for id in 0..self.options.workers.max(1) {
            let worker = Worker {
                store: Arc::clone(&self.store),
                fetcher: Arc::clone(&self.fetcher),
                retry: self.options.artifact_retry.clone(),
                attempt_timeout: self.options.attempt_timeout,
            };
            workers.spawn(worker.run(
                id,
                Arc::clone(&job_rx),
                result_tx.clone(),
                worker_cancel.clone(),
            ));
        }
        drop(result_tx);

        let mut catalogs = JoinSet::new();
        let mut catalog_tasks = HashMap::new();
        for version in &run.order {
            let task = fetch_catalog(
                Arc::clone(&self.catalogs),
                version.clone(),
                self.options.catalog_retry.clone(),
                self.options.catalog_timeout,
                cancel.clone(),
            );
            let handle = catalogs.spawn(task);
            catalog_tasks.insert(handle.id(), version.clone());
        }

        while !catalogs.is_empty() || !run.in_flight.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                joined = catalogs.join_next_with_id(), if !catalogs.is_empty() => {
                    let (version, result) = match joined {
                        Some(Ok((_, (version, Some(result))))) => (version, result),
                        Some(Ok((_, (_, None)))) | None => continue,
                        Some(Err(e)) => {
                            let Some(version) = catalog_tasks.get(&e.id()).cloned() else {
                                continue;
                            };
                            error!(%version, "catalog task failed: {e}");
                            run.fail(&version, format!("catalog task failed: {e}"));
                            continue;
                        }
                    };

                    for request in self.on_catalog(&mut run, version, result) {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            sent = job_tx.send(request) => {
                                if sent.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                outcome = result_rx.recv(), if !run.in_flight.is_empty() => {
                    match outcome {
                        Some(outcome) => self.on_outcome(&mut run, outcome),
                        None => {
                            error!("all fetch workers stopped with downloads outstanding");
                            break;
                        }
                    }
                }
            }
        }

        let cancelled = cancel.is_cancelled();
        if cancelled {
            warn!("run cancelled; waiting for in-flight work to stop");
            catalogs.abort_all();
            worker_cancel.cancel();
        }
        drop(job_tx);
        while workers.join_next().await.is_some() {}

        let mut report = RunReport {
            cancelled,
            ..RunReport::default()
        };

        if cancelled {
            report.feedback.push(Feedback::warning(
                "run cancelled; retirement skipped",
            ));
        } else if self.options.retire {
            match self.retire(&run) {
                Ok(retired) => {
                    info!(
                        retired = retired.retired.len(),
                        swept = retired.swept,
                        withdrawn = retired.withdrawn.len(),
                        "retirement finished"
                    );
                    report.retirement = Some(retired);
                }
                Err(e) => {
                    error!("retirement failed: {e}");
                    report
                        .feedback
                        .push(Feedback::error(format!("retirement failed: {e}")));
                }
            }
        }

        report.versions = run.finish(cancelled);
        report
    }

    fn on_catalog(
        &self,
        run: &mut RunState,
        version: ProductVersion,
        result: Result<Catalog, CatalogError>,
    ) -> Vec<FetchRequest> {
        let catalog = match result {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!(%version, "skipping version: {e}");
                run.fail(&version, e.to_string());
                return Vec::new();
            }
        };

        let Some(progress) = run.versions.get_mut(&version) else {
            return Vec::new();
        };
        progress.advance(&version, VersionState::CatalogFetched);
        for item in &catalog.feedback {
            item.emit(version.as_str());
        }
        progress.feedback.extend(catalog.feedback);

        let entries = plan::filter_included(catalog.entries, self.options.include.as_ref());
        let plan = match plan::plan(&entries, self.store.as_ref()) {
            Ok(plan) => plan,
            Err(e) => {
                error!(%version, "planning failed: {e}");
                progress.fail(&version, format!("planning failed: {e}"));
                return Vec::new();
            }
        };
        progress.advance(&version, VersionState::Planned);
        info!(
            %version,
            fetch = plan.to_fetch.len(),
            keep = plan.to_keep.len(),
            "planned catalog"
        );

        progress.entries = entries;
        progress.kept = plan.to_keep.len();
        for (entry, stored) in plan.to_keep {
            progress.resolved.insert(entry.key, stored);
        }
        progress.advance(&version, VersionState::Fetching);

        let mut jobs = Vec::new();
        for (entry, reason) in plan.to_fetch {
            log_fetch_reason(&version, &entry, &reason);
            let key = entry.key.clone();

            if let Some(outcome) = run.finished.get(&key) {
                progress.pending.insert(key);
                progress.apply(outcome);
            } else if let Some(waiters) = run.in_flight.get_mut(&key) {
                debug!(%version, artifact = %key, "download already in flight");
                waiters.push(version.clone());
                progress.pending.insert(key);
            } else {
                run.in_flight.insert(key.clone(), vec![version.clone()]);
                progress.pending.insert(key);
                jobs.push(FetchRequest::for_entry(&entry));
            }
        }

        if progress.pending.is_empty() {
            self.publish(&version, progress);
        }

        jobs
    }

    fn on_outcome(&self, run: &mut RunState, outcome: FetchOutcome) {
        let key = outcome.key().clone();
        match &outcome {
            FetchOutcome::Fetched { artifact, attempts } => {
                info!(artifact = %key, size = artifact.size, attempts, "artifact stored");
            }
            FetchOutcome::Failed {
                error,
                attempts,
                exhausted,
                ..
            } => {
                warn!(
                    artifact = %key,
                    kind = error.kind(),
                    attempts,
                    exhausted,
                    "artifact failed: {error}"
                );
            }
        }

        let waiters = run.in_flight.remove(&key).unwrap_or_default();
        for version in waiters {
            let Some(progress) = run.versions.get_mut(&version) else {
                continue;
            };
            if progress.state != VersionState::Fetching {
                continue;
            }
            progress.apply(&outcome);
            if progress.pending.is_empty() {
                self.publish(&version, progress);
            }
        }
        run.finished.insert(key, outcome);
    }

    fn publish(&self, version: &ProductVersion, progress: &mut VersionProgress) {
        let catalog = progress.local_catalog(version);
        match self.store.publish_catalog(&catalog) {
            Ok(published) => {
                info!(
                    %version,
                    entries = published.entries,
                    path = %published.path.display(),
                    "catalog published"
                );
                progress.advance(version, VersionState::Published);
                progress.status = Some(VersionStatus::Published {
                    path: published.path,
                });
            }
            Err(e) => {
                error!(%version, "publish failed, previous catalog kept: {e}");
                progress.fail(version, format!("publish failed: {e}"));
            }
        }
    }

    fn retire(&self, run: &RunState) -> Result<RetireReport, StoreError> {
        let configured: HashSet<&ProductVersion> = run.order.iter().collect();

        let mut withdrawn = Vec::new();
        for version in self.store.published_versions()? {
            if !configured.contains(&version) {
                info!(%version, "withdrawing catalog of unconfigured version");
                self.store.withdraw_catalog(&version)?;
                withdrawn.push(version);
            }
        }

        let mut retained = HashSet::new();
        for version in &run.order {
            retained.extend(self.store.published_keys(version)?);
        }
        for progress in run.versions.values() {
            if progress.state == VersionState::Published {
                retained.extend(progress.resolved.keys().cloned());
            }
        }

        let mut report = self.store.retire_unreferenced(&retained)?;
        report.withdrawn = withdrawn;
        Ok(report)
    }
}

fn log_fetch_reason(version: &ProductVersion, entry: &CatalogEntry, reason: &FetchReason) {
    match reason {
        FetchReason::Missing => debug!(%version, artifact = %entry.key, "artifact missing"),
        FetchReason::ChecksumChanged { stored } => debug!(
            %version,
            artifact = %entry.key,
            stored = %stored,
            "stored checksum differs from catalog"
        ),
        FetchReason::SizeChanged { stored } => debug!(
            %version,
            artifact = %entry.key,
            stored,
            "stored size differs from catalog"
        ),
    }
}

/// Fetch one catalog, retrying unreachable responses. Returns `None` when
/// cancelled.
async fn fetch_catalog(
    source: Arc<dyn CatalogSource>,
    version: ProductVersion,
    policy: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
) -> (ProductVersion, Option<Result<Catalog, CatalogError>>) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (version, None),
            result = tokio::time::timeout(timeout, source.fetch_catalog(&version)) => {
                result.unwrap_or_else(|_| {
                    Err(CatalogError::Unreachable(format!("timed out after {timeout:?}")))
                })
            }
        };

        match result {
            Ok(catalog) => {
                debug!(%version, attempt, entries = catalog.entries.len(), "catalog fetched");
                return (version, Some(Ok(catalog)));
            }
            Err(e) if e.is_retryable() && policy.allows_retry(attempt) => {
                let delay = policy.delay_for(attempt);
                warn!(%version, attempt, ?delay, "catalog fetch failed, retrying: {e}");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (version, None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return (version, Some(Err(e))),
        }
    }
}

/// One member of the fetch pool.
struct Worker {
    store: Arc<dyn MirrorStore>,
    fetcher: Arc<dyn ArtifactFetcher>,
    retry: RetryPolicy,
    attempt_timeout: Duration,
}

impl Worker {
    async fn run(
        self,
        id: usize,
        jobs: Arc<Mutex<mpsc::Receiver<FetchRequest>>>,
        results: mpsc::UnboundedSender<FetchOutcome>,
        cancel: CancellationToken,
    ) {
        loop {
            let next = {
                let mut queue = jobs.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    request = queue.recv() => request,
                }
            };
            let Some(request) = next else { break };

            let Some(outcome) = self.fetch_with_retry(&request, &cancel).await else {
                debug!(worker = id, artifact = %request.key, "download abandoned");
                break;
            };
            if results.send(outcome).is_err() {
                break;
            }
        }
        debug!(worker = id, "fetch worker stopped");
    }

    /// Download and commit one artifact. Returns `None` when cancelled; any
    /// staged file is dropped, which deletes it.
    async fn fetch_with_retry(
        &self,
        request: &FetchRequest,
        cancel: &CancellationToken,
    ) -> Option<FetchOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                result = tokio::time::timeout(
                    self.attempt_timeout,
                    self.fetcher.fetch(request, self.store.staging_dir()),
                ) => result,
            };

            let error = match result {
                Ok(Ok(fetched)) => match self.store.commit_artifact(fetched) {
                    Ok(artifact) => {
                        return Some(FetchOutcome::Fetched {
                            artifact,
                            attempts: attempt,
                        });
                    }
                    Err(e) => FetchError::Storage(e.to_string()),
                },
                Ok(Err(e)) => e,
                Err(_) => FetchError::Transient(format!(
                    "attempt timed out after {:?}",
                    self.attempt_timeout
                )),
            };

            if !error.is_retryable() || !self.retry.allows_retry(attempt) {
                return Some(FetchOutcome::Failed {
                    key: request.key.clone(),
                    exhausted: error.is_retryable(),
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.retry.delay_for(attempt);
            debug!(artifact = %request.key, attempt, ?delay, "retrying: {error}");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Aggregator-owned state for one run.
struct RunState {
    order: Vec<ProductVersion>,
    versions: HashMap<ProductVersion, VersionProgress>,
    /// Keys queued or downloading, with the versions waiting on them.
    in_flight: HashMap<ArtifactKey, Vec<ProductVersion>>,
    /// Outcomes already produced this run.
    finished: HashMap<ArtifactKey, FetchOutcome>,
}

impl RunState {
    fn new(versions: &[ProductVersion]) -> Self {
        let mut order = Vec::new();
        let mut progress = HashMap::new();
        for version in versions {
            if !progress.contains_key(version) {
                progress.insert(version.clone(), VersionProgress::default());
                order.push(version.clone());
            }
        }
        Self {
            order,
            versions: progress,
            in_flight: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    fn fail(&mut self, version: &ProductVersion, reason: String) {
        if let Some(progress) = self.versions.get_mut(version) {
            progress.fail(version, reason);
        }
    }

    /// Settle every version still in progress and produce reports in
    /// configured order.
    fn finish(mut self, cancelled: bool) -> Vec<VersionReport> {
        self.order
            .iter()
            .map(|version| {
                let progress = self.versions.remove(version).unwrap_or_default();
                progress.into_report(version.clone(), cancelled)
            })
            .collect()
    }
}

#[derive(Default)]
struct VersionProgress {
    state: VersionState,
    entries: Vec<CatalogEntry>,
    resolved: HashMap<ArtifactKey, StoredArtifact>,
    pending: HashSet<ArtifactKey>,
    kept: usize,
    fetched: usize,
    failed: Vec<FailedEntry>,
    feedback: Vec<Feedback>,
    status: Option<VersionStatus>,
}

impl VersionProgress {
    fn advance(&mut self, version: &ProductVersion, next: VersionState) {
        if !self.state.can_advance_to(next) {
            warn!(%version, from = %self.state, to = %next, "ignoring invalid state change");
            return;
        }
        debug!(%version, from = %self.state, to = %next, "version state");
        self.state = next;
    }

    fn fail(&mut self, version: &ProductVersion, reason: String) {
        self.advance(version, VersionState::Failed);
        self.feedback.push(Feedback::error(reason.clone()));
        self.status = Some(VersionStatus::Failed { reason });
    }

    fn apply(&mut self, outcome: &FetchOutcome) {
        if !self.pending.remove(outcome.key()) {
            return;
        }
        match outcome {
            FetchOutcome::Fetched { artifact, .. } => {
                self.resolved.insert(artifact.key.clone(), artifact.clone());
                self.fetched += 1;
            }
            FetchOutcome::Failed {
                key,
                error,
                attempts,
                ..
            } => {
                self.feedback.push(Feedback::warning(format!(
                    "{key} left out of catalog: {error}"
                )));
                self.failed.push(FailedEntry {
                    key: key.clone(),
                    error: error.clone(),
                    attempts: *attempts,
                });
            }
        }
    }

    /// Entries in upstream order, limited to those with a stored artifact.
    fn local_catalog(&self, version: &ProductVersion) -> LocalCatalog {
        let mut seen = HashSet::new();
        let entries = self
            .entries
            .iter()
            .filter(|entry| seen.insert(&entry.key))
            .filter_map(|entry| {
                self.resolved.get(&entry.key).map(|artifact| LocalCatalogEntry {
                    entry: entry.clone(),
                    artifact: artifact.clone(),
                })
            })
            .collect();

        LocalCatalog {
            version: version.clone(),
            entries,
        }
    }

    fn into_report(mut self, version: ProductVersion, cancelled: bool) -> VersionReport {
        let status = match self.status.take() {
            Some(status) => status,
            None if cancelled => VersionStatus::Cancelled,
            None => VersionStatus::Failed {
                reason: format!("run ended while {}", self.state),
            },
        };

        VersionReport {
            version,
            status,
            fetched: self.fetched,
            kept: self.kept,
            failed: self.failed,
            feedback: self.feedback,
        }
    }
}
